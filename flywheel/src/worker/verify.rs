//! Fast verifiers
//!
//! The VERIFY phase runs only the cheap subset of QA: linters and type
//! checkers, recognized by tool name or command alias. A failing verifier
//! gets one agent fix round before QA runs authoritatively.

/// Tool names that mark a command as a fast verifier
const VERIFIER_TOOLS: &[&str] = &[
    "eslint",
    "biome",
    "tsc",
    "mypy",
    "pyright",
    "ruff",
    "clippy",
    "golangci-lint",
    "rubocop",
    "credo",
];

/// Script aliases that count as verifiers
const VERIFIER_ALIASES: &[&str] = &["lint", "typecheck", "check"];

/// Whether a QA command is a fast verifier
pub fn is_fast_verifier(command: &str) -> bool {
    let lower = command.to_lowercase();

    if VERIFIER_TOOLS.iter().any(|tool| lower.contains(tool)) {
        return true;
    }

    // Script aliases: the last word of the command (e.g. `npm run lint`,
    // `make check`).
    if let Some(last) = lower.split_whitespace().last() {
        if VERIFIER_ALIASES.contains(&last) {
            return true;
        }
    }

    false
}

/// The fast-verifier subset of a QA command list
pub fn fast_verifiers(commands: &[String]) -> Vec<String> {
    commands
        .iter()
        .filter(|c| is_fast_verifier(c))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_detected() {
        assert!(is_fast_verifier("npx eslint src/"));
        assert!(is_fast_verifier("tsc --noEmit"));
        assert!(is_fast_verifier("cargo clippy -- -D warnings"));
        assert!(is_fast_verifier("mypy app/"));
        assert!(is_fast_verifier("bundle exec rubocop"));
    }

    #[test]
    fn test_aliases_detected() {
        assert!(is_fast_verifier("npm run lint"));
        assert!(is_fast_verifier("make check"));
        assert!(is_fast_verifier("yarn typecheck"));
    }

    #[test]
    fn test_tests_are_not_verifiers() {
        assert!(!is_fast_verifier("npm test"));
        assert!(!is_fast_verifier("cargo test"));
        assert!(!is_fast_verifier("pytest tests/"));
    }

    #[test]
    fn test_subset_extraction() {
        let commands: Vec<String> = ["npm run lint", "npm test", "tsc --noEmit"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            fast_verifiers(&commands),
            vec!["npm run lint", "tsc --noEmit"]
        );
    }
}
