//! Trajectory YAML parsing and serialization
//!
//! A deliberately small two-space-indent reader for the trajectory
//! grammar: top-level `name`, `description` and a `steps:` list with
//! per-step fields, inline or block lists, and an optional nested
//! `measure` mapping. Steps lacking an `id` are dropped; a step carrying a
//! title but no id draws a warning first. Parser and serializer
//! round-trip.

use crate::trajectory::types::{Measure, MeasureDirection, Trajectory, TrajectoryStep};
use tracing::warn;

/// Strip surrounding quotes and whitespace from a scalar
fn strip_scalar(raw: &str) -> String {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Accept both `[a, b, c]` and bare comma-separated values
pub fn parse_simple_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let inner = if trimmed.starts_with('[') && trimmed.ends_with(']') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    inner
        .split(',')
        .map(strip_scalar)
        .filter(|s| !s.is_empty())
        .collect()
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// Split `key: value`; value may be empty
fn split_key_value(line: &str) -> Option<(String, String)> {
    let idx = line.find(':')?;
    let key = line[..idx].trim().to_string();
    let value = line[idx + 1..].trim().to_string();
    if key.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

#[derive(Default)]
struct StepBuilder {
    id: String,
    title: String,
    description: String,
    scope: Option<String>,
    categories: Vec<String>,
    acceptance_criteria: Vec<String>,
    verification_commands: Vec<String>,
    depends_on: Vec<String>,
    priority: Option<u8>,
    max_retries: Option<u32>,
    measure_cmd: Option<String>,
    measure_target: Option<f64>,
    measure_direction: Option<MeasureDirection>,
}

impl StepBuilder {
    fn build(self) -> Option<TrajectoryStep> {
        if self.id.is_empty() {
            if !self.title.is_empty() {
                warn!(title = %self.title, "Dropping trajectory step with a title but no id");
            }
            return None;
        }

        let measure = match (self.measure_cmd, self.measure_target, self.measure_direction) {
            (Some(cmd), Some(target), Some(direction)) => Some(Measure {
                cmd,
                target,
                direction,
            }),
            _ => None,
        };

        Some(TrajectoryStep {
            id: self.id,
            title: self.title,
            description: self.description,
            scope: self.scope,
            categories: self.categories,
            acceptance_criteria: self.acceptance_criteria,
            verification_commands: self.verification_commands,
            depends_on: self.depends_on,
            priority: self.priority,
            max_retries: self.max_retries,
            measure,
        })
    }

    fn set_field(&mut self, key: &str, value: &str) -> FieldKind {
        match key {
            "id" => self.id = strip_scalar(value),
            "title" => self.title = strip_scalar(value),
            "description" => self.description = strip_scalar(value),
            "scope" => {
                let scope = strip_scalar(value);
                if !scope.is_empty() {
                    self.scope = Some(scope);
                }
            }
            "categories" => {
                if value.is_empty() {
                    return FieldKind::BlockList;
                }
                self.categories = parse_simple_list(value);
            }
            "acceptance_criteria" => {
                if value.is_empty() {
                    return FieldKind::BlockList;
                }
                self.acceptance_criteria = parse_simple_list(value);
            }
            "verification_commands" => {
                if value.is_empty() {
                    return FieldKind::BlockList;
                }
                self.verification_commands = parse_simple_list(value);
            }
            "depends_on" => {
                if value.is_empty() {
                    return FieldKind::BlockList;
                }
                self.depends_on = parse_simple_list(value);
            }
            "priority" => self.priority = strip_scalar(value).parse().ok(),
            "max_retries" => self.max_retries = strip_scalar(value).parse().ok(),
            "measure" => return FieldKind::MeasureMap,
            _ => {}
        }
        FieldKind::Scalar
    }

    fn push_list_item(&mut self, field: &str, item: String) {
        match field {
            "categories" => self.categories.push(item),
            "acceptance_criteria" => self.acceptance_criteria.push(item),
            "verification_commands" => self.verification_commands.push(item),
            "depends_on" => self.depends_on.push(item),
            _ => {}
        }
    }

    fn set_measure_field(&mut self, key: &str, value: &str) {
        match key {
            "cmd" => self.measure_cmd = Some(strip_scalar(value)),
            "target" => self.measure_target = strip_scalar(value).parse().ok(),
            "direction" => {
                self.measure_direction = match strip_scalar(value).as_str() {
                    "up" => Some(MeasureDirection::Up),
                    "down" => Some(MeasureDirection::Down),
                    _ => None,
                }
            }
            _ => {}
        }
    }
}

enum FieldKind {
    Scalar,
    BlockList,
    MeasureMap,
}

/// Parse trajectory YAML. Errors only on a missing `name`; malformed
/// steps degrade per the leniency rules.
pub fn parse_trajectory_yaml(content: &str) -> Result<Trajectory, String> {
    let mut name = String::new();
    let mut description = String::new();
    let mut steps: Vec<TrajectoryStep> = Vec::new();

    let mut in_steps = false;
    let mut current: Option<StepBuilder> = None;
    let mut pending_list: Option<String> = None;
    let mut measure_indent: Option<usize> = None;

    for raw in content.lines() {
        if raw.trim().is_empty() || raw.trim_start().starts_with('#') {
            continue;
        }
        let indent = indent_of(raw);
        let trimmed = raw.trim();

        if indent == 0 {
            if let Some(builder) = current.take() {
                steps.extend(builder.build());
            }
            in_steps = false;
            pending_list = None;
            measure_indent = None;

            if let Some((key, value)) = split_key_value(trimmed) {
                match key.as_str() {
                    "name" => name = strip_scalar(&value),
                    "description" => description = strip_scalar(&value),
                    "steps" => in_steps = true,
                    _ => {}
                }
            }
            continue;
        }

        if !in_steps {
            continue;
        }

        // New list item at step level starts a step.
        if indent == 2 && trimmed.starts_with("- ") {
            if let Some(builder) = current.take() {
                steps.extend(builder.build());
            }
            let mut builder = StepBuilder::default();
            pending_list = None;
            measure_indent = None;
            if let Some((key, value)) = split_key_value(&trimmed[2..]) {
                match builder.set_field(&key, &value) {
                    FieldKind::BlockList => pending_list = Some(key),
                    FieldKind::MeasureMap => measure_indent = Some(4),
                    FieldKind::Scalar => {}
                }
            }
            current = Some(builder);
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };

        // Nested measure fields.
        if let Some(m_indent) = measure_indent {
            if indent > m_indent && !trimmed.starts_with("- ") {
                if let Some((key, value)) = split_key_value(trimmed) {
                    builder.set_measure_field(&key, &value);
                }
                continue;
            }
            measure_indent = None;
        }

        // Block list items.
        if trimmed.starts_with("- ") {
            if let Some(field) = &pending_list {
                builder.push_list_item(field, strip_scalar(&trimmed[2..]));
            }
            continue;
        }

        // Regular step field.
        if let Some((key, value)) = split_key_value(trimmed) {
            pending_list = None;
            match builder.set_field(&key, &value) {
                FieldKind::BlockList => pending_list = Some(key),
                FieldKind::MeasureMap => measure_indent = Some(indent),
                FieldKind::Scalar => {}
            }
        }
    }

    if let Some(builder) = current.take() {
        steps.extend(builder.build());
    }

    if name.is_empty() {
        return Err("trajectory has no name".to_string());
    }

    Ok(Trajectory {
        name,
        description,
        steps,
    })
}

fn fmt_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn write_inline_list(out: &mut String, indent: &str, key: &str, items: &[String]) {
    if !items.is_empty() {
        out.push_str(&format!("{indent}{key}: [{}]\n", items.join(", ")));
    }
}

fn write_block_list(out: &mut String, indent: &str, key: &str, items: &[String]) {
    if !items.is_empty() {
        out.push_str(&format!("{indent}{key}:\n"));
        for item in items {
            out.push_str(&format!("{indent}  - {item}\n"));
        }
    }
}

/// Serialize a trajectory back to the YAML grammar
pub fn serialize_trajectory_to_yaml(trajectory: &Trajectory) -> String {
    let mut out = String::new();
    out.push_str(&format!("name: {}\n", trajectory.name));
    if !trajectory.description.is_empty() {
        out.push_str(&format!("description: {}\n", trajectory.description));
    }
    out.push_str("steps:\n");

    for step in &trajectory.steps {
        out.push_str(&format!("  - id: {}\n", step.id));
        out.push_str(&format!("    title: {}\n", step.title));
        if !step.description.is_empty() {
            out.push_str(&format!("    description: {}\n", step.description));
        }
        if let Some(scope) = &step.scope {
            out.push_str(&format!("    scope: {scope}\n"));
        }
        write_inline_list(&mut out, "    ", "categories", &step.categories);
        write_block_list(&mut out, "    ", "acceptance_criteria", &step.acceptance_criteria);
        write_block_list(
            &mut out,
            "    ",
            "verification_commands",
            &step.verification_commands,
        );
        write_inline_list(&mut out, "    ", "depends_on", &step.depends_on);
        if let Some(priority) = step.priority {
            out.push_str(&format!("    priority: {priority}\n"));
        }
        if let Some(max_retries) = step.max_retries {
            out.push_str(&format!("    max_retries: {max_retries}\n"));
        }
        if let Some(measure) = &step.measure {
            out.push_str("    measure:\n");
            out.push_str(&format!("      cmd: {}\n", measure.cmd));
            out.push_str(&format!("      target: {}\n", fmt_number(measure.target)));
            let direction = match measure.direction {
                MeasureDirection::Up => "up",
                MeasureDirection::Down => "down",
            };
            out.push_str(&format!("      direction: {direction}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: tighten-auth-1699999999999
description: Shore up the auth module
steps:
  - id: extract-util
    title: Extract auth util
    description: Pull the shared helper out of login
    scope: src/auth/**
    categories: [refactor, cleanup]
    acceptance_criteria:
      - helper has its own module
      - call sites updated
    verification_commands:
      - npm test
      - npm run lint
    priority: 7
  - id: add-tests
    title: Add coverage
    depends_on: [extract-util]
    max_retries: 4
    measure:
      cmd: grep -c "it(" src/auth/util.test.ts
      target: 5
      direction: up
"#;

    #[test]
    fn test_parse_sample() {
        let t = parse_trajectory_yaml(SAMPLE).unwrap();
        assert_eq!(t.name, "tighten-auth-1699999999999");
        assert_eq!(t.steps.len(), 2);

        let first = &t.steps[0];
        assert_eq!(first.scope.as_deref(), Some("src/auth/**"));
        assert_eq!(first.categories, vec!["refactor", "cleanup"]);
        assert_eq!(first.acceptance_criteria.len(), 2);
        assert_eq!(first.verification_commands, vec!["npm test", "npm run lint"]);
        assert_eq!(first.priority, Some(7));

        let second = &t.steps[1];
        assert_eq!(second.depends_on, vec!["extract-util"]);
        assert_eq!(second.max_retries, Some(4));
        let measure = second.measure.as_ref().unwrap();
        assert_eq!(measure.target, 5.0);
        assert_eq!(measure.direction, MeasureDirection::Up);
        assert!(measure.cmd.contains("grep"));
    }

    #[test]
    fn test_roundtrip_preserves_everything() {
        let original = parse_trajectory_yaml(SAMPLE).unwrap();
        let serialized = serialize_trajectory_to_yaml(&original);
        let back = parse_trajectory_yaml(&serialized).unwrap();

        assert_eq!(back.name, original.name);
        assert_eq!(back.description, original.description);
        assert_eq!(back.steps.len(), original.steps.len());
        for (a, b) in original.steps.iter().zip(back.steps.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.title, b.title);
            assert_eq!(a.description, b.description);
            assert_eq!(a.scope, b.scope);
            assert_eq!(a.categories, b.categories);
            assert_eq!(a.acceptance_criteria, b.acceptance_criteria);
            assert_eq!(a.verification_commands, b.verification_commands);
            assert_eq!(a.depends_on, b.depends_on);
            assert_eq!(a.priority, b.priority);
            assert_eq!(a.max_retries, b.max_retries);
            assert_eq!(a.measure, b.measure);
        }
    }

    #[test]
    fn test_step_without_id_dropped() {
        let yaml = "name: t\nsteps:\n  - title: no id here\n  - id: real\n    title: Real\n";
        let t = parse_trajectory_yaml(yaml).unwrap();
        assert_eq!(t.steps.len(), 1);
        assert_eq!(t.steps[0].id, "real");
    }

    #[test]
    fn test_quoted_scalars_stripped() {
        let yaml = "name: \"quoted-name\"\nsteps:\n  - id: 'a'\n    title: \"Quoted title\"\n";
        let t = parse_trajectory_yaml(yaml).unwrap();
        assert_eq!(t.name, "quoted-name");
        assert_eq!(t.steps[0].id, "a");
        assert_eq!(t.steps[0].title, "Quoted title");
    }

    #[test]
    fn test_parse_simple_list_forms() {
        assert_eq!(parse_simple_list("[a, b, c]"), vec!["a", "b", "c"]);
        assert_eq!(parse_simple_list("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_simple_list("[]"), Vec::<String>::new());
        assert_eq!(parse_simple_list("['x', \"y\"]"), vec!["x", "y"]);
    }

    #[test]
    fn test_missing_name_errors() {
        assert!(parse_trajectory_yaml("steps:\n  - id: a\n    title: A\n").is_err());
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let yaml = "# header\nname: t\n\nsteps:\n  # a comment\n  - id: a\n    title: A\n";
        let t = parse_trajectory_yaml(yaml).unwrap();
        assert_eq!(t.steps.len(), 1);
    }

    #[test]
    fn test_commands_with_colons_survive() {
        let yaml =
            "name: t\nsteps:\n  - id: a\n    title: A\n    verification_commands:\n      - make check TARGET=all\n";
        let t = parse_trajectory_yaml(yaml).unwrap();
        assert_eq!(t.steps[0].verification_commands[0], "make check TARGET=all");
    }
}
