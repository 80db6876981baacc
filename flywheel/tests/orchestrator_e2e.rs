//! End-to-end session scenarios
//!
//! Runs the orchestrator against a scripted agent backend, a stub git
//! and a scripted command runner, and checks outcomes through the
//! persisted state layout: ticket journal, sector file, run-state and
//! the event log.

use async_trait::async_trait;
use flywheel::backend::{AgentResponse, AgentStatus, ScriptedBackend};
use flywheel::command::{CommandOutput, CommandRunner, ScriptedRunner};
use flywheel::config::WheelConfig;
use flywheel::git::StubGit;
use flywheel::orchestrator::Orchestrator;
use flywheel::session::ShutdownReason;
use flywheel::store::EventRecord;
use flywheel::tickets::{JsonTicketRepo, TicketRepo, TicketStatus};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write(root: &Path, rel: &str, content: &str) {
    let full = root.join(rel);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

fn seed_repo(root: &Path) {
    write(root, "src/auth/util.ts", "export const token = () => 1;\n");
    write(root, "src/auth/login.ts", "import { token } from './util';\n");
    write(root, "src/auth/session.ts", "export const s = 2;\n");
    write(root, "src/auth/guard.ts", "export const g = 3;\n");
    write(root, "src/auth/mfa.ts", "export const m = 4;\n");
}

/// Extra sectors sorting after `src/auth`, so auth is still scouted
/// first while overall coverage stays below the convergence threshold.
fn seed_extra_sectors(root: &Path) {
    write(root, "src/db/pool.ts", "export const pool = 1;\n");
    write(root, "src/ui/button.ts", "export const b = 1;\n");
}

fn scout_response(proposals: serde_json::Value) -> AgentResponse {
    AgentResponse {
        status: AgentStatus::Completed,
        changed_files: vec![],
        lines_added: 0,
        lines_removed: 0,
        diff: None,
        stdout: Some(proposals.to_string()),
    }
}

fn plan_response(paths: &[&str]) -> AgentResponse {
    let files: Vec<serde_json::Value> = paths
        .iter()
        .map(|p| json!({"path": p, "action": "modify", "reason": "cleanup"}))
        .collect();
    AgentResponse {
        status: AgentStatus::Completed,
        changed_files: vec![],
        lines_added: 0,
        lines_removed: 0,
        diff: None,
        stdout: Some(
            json!({
                "files_to_touch": files,
                "expected_tests": ["auth util"],
                "risk_level": "low",
                "estimated_lines": 40
            })
            .to_string(),
        ),
    }
}

fn exec_response(files: &[&str]) -> AgentResponse {
    AgentResponse {
        status: AgentStatus::Completed,
        changed_files: files.iter().map(|s| s.to_string()).collect(),
        lines_added: 25,
        lines_removed: 5,
        diff: Some("+export const extracted = () => 1;".to_string()),
        stdout: Some("implemented the extraction".to_string()),
    }
}

fn test_config(step_budget: u64) -> WheelConfig {
    let mut config = WheelConfig::default();
    config.budget.step_budget = step_budget;
    config.budget.parallel = 2;
    config.budget.max_prs = 10;
    config.qa_commands = vec!["npm test".to_string()];
    config
}

struct Session {
    orchestrator: Orchestrator,
    repo: Arc<JsonTicketRepo>,
    git: Arc<StubGit>,
}

fn build_session(
    root: &Path,
    config: WheelConfig,
    backend: ScriptedBackend,
    runner: Arc<dyn CommandRunner>,
) -> Session {
    let repo = Arc::new(
        JsonTicketRepo::open(config.state_dir(root).join("tickets.json")).unwrap(),
    );
    let git = Arc::new(StubGit::new());
    let mut orchestrator = Orchestrator::new(
        root.to_path_buf(),
        config,
        Arc::new(backend),
        git.clone(),
        repo.clone(),
        runner,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();
    orchestrator.pacing.inter_cycle = Duration::ZERO;
    orchestrator.pacing.inter_cycle_trajectory = Duration::ZERO;
    orchestrator.pacing.backpressure = Duration::ZERO;
    Session {
        orchestrator,
        repo,
        git,
    }
}

fn read_events(runs_dir: &Path) -> Vec<EventRecord> {
    let mut records = Vec::new();
    for run in std::fs::read_dir(runs_dir).unwrap().flatten() {
        let log = run.path().join("events.ndjson");
        if log.exists() {
            let content = std::fs::read_to_string(log).unwrap();
            for line in content.lines() {
                records.push(serde_json::from_str(line).unwrap());
            }
        }
    }
    records
}

#[tokio::test]
async fn test_happy_path_session() {
    let dir = tempfile::tempdir().unwrap();
    seed_repo(dir.path());

    let backend = ScriptedBackend::new()
        .push(scout_response(json!([{
            "title": "Extract auth util",
            "description": "pull the token helper into its own module",
            "category": "refactor",
            "files": ["src/auth/util.ts"],
            "allowed_paths": ["src/auth/**"],
            "confidence": 85,
            "impact_score": 7,
            "estimated_complexity": "simple"
        }])))
        .push(plan_response(&["src/auth/util.ts"]))
        .push(exec_response(&["src/auth/util.ts"]));

    let mut session = build_session(
        dir.path(),
        test_config(1),
        backend,
        Arc::new(ScriptedRunner::new()),
    );

    let reason = session.orchestrator.run().await.unwrap();
    assert_eq!(reason, ShutdownReason::BudgetExhausted);

    // One ticket, done.
    let tickets = session.repo.list().unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, TicketStatus::Done);
    assert_eq!(tickets[0].title, "Extract auth util");

    // One PR opened through git.
    assert_eq!(session.git.call_count("open_pr"), 1);

    // Sector state persisted with the scan recorded.
    let sectors: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(".flywheel/sectors.json")).unwrap(),
    )
    .unwrap();
    let auth = sectors["sectors"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["path"] == "src/auth")
        .unwrap();
    assert!(auth["last_scanned_at"].as_i64().unwrap() > 0);
    assert_eq!(auth["scan_count"].as_u64().unwrap(), 1);
    let yield_ = auth["proposal_yield"].as_f64().unwrap();
    assert!((yield_ - 0.3).abs() < 1e-9, "yield = {yield_}");

    // Event log carries the phase milestones.
    let events = read_events(&dir.path().join(".flywheel/runs"));
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"SCOUT_OUTPUT"));
    assert!(kinds.contains(&"PROPOSALS_FILTERED"));
    assert!(kinds.contains(&"PLAN_APPROVED"));
    assert!(kinds.contains(&"QA_PASSED"));
    assert!(kinds.contains(&"PR_CREATED"));

    // Run-state journal round-tripped.
    let run_state: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(".flywheel/run-state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(run_state["total_cycles"].as_u64().unwrap(), 1);
}

#[tokio::test]
async fn test_low_yield_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    seed_repo(dir.path());
    seed_extra_sectors(dir.path());

    // Scout finds nothing, every cycle.
    let backend = ScriptedBackend::new().push(scout_response(json!([])));

    let mut session = build_session(
        dir.path(),
        test_config(50),
        backend,
        Arc::new(ScriptedRunner::new()),
    );

    let reason = session.orchestrator.run().await.unwrap();
    assert_eq!(reason, ShutdownReason::LowYield);
    assert!(session.repo.list().unwrap().is_empty());
}

/// Runner that passes a matched command a fixed number of times (the
/// baseline capture), then fails it. Everything else passes.
struct RegressingRunner {
    needle: String,
    passes_left: AtomicU32,
    failure_output: String,
}

#[async_trait]
impl CommandRunner for RegressingRunner {
    async fn run(&self, command: &str, _cwd: &Path, _timeout: Duration) -> CommandOutput {
        if command.contains(&self.needle) {
            let left = self.passes_left.load(Ordering::Relaxed);
            if left == 0 {
                return CommandOutput {
                    exit_code: Some(1),
                    output: self.failure_output.clone(),
                    timed_out: false,
                };
            }
            self.passes_left.store(left - 1, Ordering::Relaxed);
        }
        CommandOutput {
            exit_code: Some(0),
            output: String::new(),
            timed_out: false,
        }
    }
}

#[tokio::test]
async fn test_qa_failure_blocks_then_cleanup_aborts() {
    let dir = tempfile::tempdir().unwrap();
    seed_repo(dir.path());
    seed_extra_sectors(dir.path());

    let backend = ScriptedBackend::new()
        .push(scout_response(json!([{
            "title": "Tighten the guard",
            "description": "harden guard checks",
            "category": "fix",
            "files": ["src/auth/guard.ts"],
            "allowed_paths": ["src/auth/**"],
            "confidence": 90,
            "impact_score": 6,
            "estimated_complexity": "simple"
        }])))
        .push(plan_response(&["src/auth/guard.ts"]))
        .push(exec_response(&["src/auth/guard.ts"]));

    // `npm test` passes at baseline capture, then regresses under the
    // agent's change.
    let runner = RegressingRunner {
        needle: "npm test".to_string(),
        passes_left: AtomicU32::new(1),
        failure_output: "AssertionError: guard is broken".to_string(),
    };
    let mut config = test_config(1);
    config.spindle.enabled = false;

    let mut session = build_session(dir.path(), config, backend, Arc::new(runner));
    let reason = session.orchestrator.run().await.unwrap();
    assert_eq!(reason, ShutdownReason::BudgetExhausted);

    // QA exhaustion blocked the ticket; session-end cleanup aborted it.
    let tickets = session.repo.list().unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, TicketStatus::Aborted);

    // Cleanup is idempotent: a second invocation changes nothing.
    session.orchestrator.session_end_cleanup();
    let again = session.repo.list().unwrap();
    assert_eq!(again[0].status, TicketStatus::Aborted);

    let events = read_events(&dir.path().join(".flywheel/runs"));
    assert!(events.iter().any(|e| e.kind == "QA_FAILED"));
}

/// Runner that fails a matched command a fixed number of times, then
/// passes. Everything else passes.
struct FlakyRunner {
    needle: String,
    failures_left: AtomicU32,
}

#[async_trait]
impl CommandRunner for FlakyRunner {
    async fn run(&self, command: &str, _cwd: &Path, _timeout: Duration) -> CommandOutput {
        if command.contains(&self.needle) {
            let left = self.failures_left.load(Ordering::Relaxed);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Relaxed);
                return CommandOutput {
                    exit_code: Some(1),
                    output: "step not satisfied yet".to_string(),
                    timed_out: false,
                };
            }
        }
        CommandOutput {
            exit_code: Some(0),
            output: String::new(),
            timed_out: false,
        }
    }
}

#[tokio::test]
async fn test_trajectory_guided_step_completes() {
    let dir = tempfile::tempdir().unwrap();
    seed_repo(dir.path());

    // A one-step trajectory, already active on disk.
    write(
        dir.path(),
        ".flywheel/trajectories/tighten-auth-1699999999999.yaml",
        "name: tighten-auth-1699999999999\ndescription: shore up auth\nsteps:\n  - id: extract-util\n    title: Extract auth util\n    description: pull the helper out\n    scope: src/auth/**\n    categories: [refactor]\n    verification_commands:\n      - check-step\n",
    );
    write(
        dir.path(),
        ".flywheel/trajectory-state.json",
        &json!({
            "trajectory_name": "tighten-auth-1699999999999",
            "started_at": "2026-01-01T00:00:00Z",
            "step_states": {
                "extract-util": {
                    "status": "active",
                    "cycles_attempted": 0,
                    "last_attempted_cycle": 0,
                    "consecutive_failures": 0,
                    "total_failures": 0
                }
            },
            "current_step_id": "extract-util",
            "paused": false,
            "status": "active"
        })
        .to_string(),
    );

    let backend = ScriptedBackend::new()
        .push(plan_response(&["src/auth/util.ts"]))
        .push(exec_response(&["src/auth/util.ts"]));

    // Pre-verify fails once (the step is not yet satisfied); after the
    // worker lands the change, verification passes.
    let runner = FlakyRunner {
        needle: "check-step".to_string(),
        failures_left: AtomicU32::new(1),
    };

    let mut config = test_config(1);
    config.qa_commands.clear();
    config.create_prs = false;

    let mut session = build_session(dir.path(), config, backend, Arc::new(runner));
    let reason = session.orchestrator.run().await.unwrap();
    assert_eq!(reason, ShutdownReason::BudgetExhausted);

    // The step's ticket ran to done.
    let tickets = session.repo.list().unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, TicketStatus::Done);
    assert_eq!(tickets[0].trajectory_step.as_deref(), Some("extract-util"));

    // The trajectory state on disk shows the step completed.
    let state: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(".flywheel/trajectory-state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(state["step_states"]["extract-util"]["status"], "completed");
    assert_eq!(state["status"], "completed");
}

#[tokio::test]
async fn test_parallel_batch_deconflicts_overlapping_tickets() {
    let dir = tempfile::tempdir().unwrap();
    seed_repo(dir.path());

    // Two proposals on the same file plus one on a disjoint file. The
    // same-file pair cannot run in one batch.
    let backend = ScriptedBackend::new()
        .push(scout_response(json!([
            {
                "title": "Refactor login flow",
                "description": "d",
                "category": "refactor",
                "files": ["src/auth/login.ts"],
                "allowed_paths": ["src/auth/login.ts"],
                "confidence": 90, "impact_score": 9, "estimated_complexity": "medium"
            },
            {
                "title": "Type the login flow",
                "description": "d",
                "category": "types",
                "files": ["src/auth/login.ts"],
                "allowed_paths": ["src/auth/login.ts"],
                "confidence": 80, "impact_score": 8, "estimated_complexity": "simple"
            },
            {
                "title": "Tidy mfa helper",
                "description": "d",
                "category": "cleanup",
                "files": ["src/auth/mfa.ts"],
                "allowed_paths": ["src/auth/mfa.ts"],
                "confidence": 75, "impact_score": 7, "estimated_complexity": "simple"
            }
        ])))
        // Plans and executions for whichever tickets dispatch; workers
        // pull responses in order, and the backend repeats the last one.
        .push(plan_response(&["src/auth/login.ts"]))
        .push(exec_response(&["src/auth/login.ts"]));

    let mut config = test_config(1);
    config.budget.parallel = 3;
    config.create_prs = false;
    config.qa_commands.clear();
    // The scout proposals target different files; allow wide plans.
    config.spindle.enabled = false;

    let mut session = build_session(
        dir.path(),
        config,
        backend,
        Arc::new(ScriptedRunner::new()),
    );
    let _ = session.orchestrator.run().await.unwrap();

    let events = read_events(&dir.path().join(".flywheel/runs"));
    let deconflicted: Vec<&EventRecord> = events
        .iter()
        .filter(|e| e.kind == "PARALLEL_DECONFLICTED")
        .collect();
    assert_eq!(deconflicted.len(), 1);
    assert_eq!(deconflicted[0].payload["skipped"].as_u64().unwrap(), 1);
}
