//! The ticket worker state machine
//!
//! Drives one ticket from plan to PR. Every agent turn is scope-checked
//! and spindle-checked; QA failures retry within per-class budgets; plan
//! rejections accumulate toward a human block. The worker owns its
//! worktree and communicates with the orchestrator only through the
//! event channel and its returned outcome.

use crate::backend::{parse_json_payload, AgentRequest, AgentResponse, AgentStatus, ExecBackend};
use crate::git::{Git, PrInfo};
use crate::proposals::ProposalCategory;
use crate::scope::{is_file_allowed, serialize_for_prompt, ScopePolicy};
use crate::spindle::{check_spindle_loop, SpindleConfig, SpindleState};
use crate::store::EventType;
use crate::tickets::{Ticket, TicketStatus};
use crate::worker::plan::{validate_plan_scope, AgentPlan, PlanRisk};
use crate::worker::prompt::{rebase_instructions, PromptBlock, PromptBuilder};
use crate::worker::qa::{run_qa_pass, QaBaseline, QaErrorClass, QA_EXCERPT_CHARS};
use crate::worker::verify::fast_verifiers;
use crate::worker::{FailureReason, TicketEvent};
use crate::command::CommandRunner;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Worker phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Init,
    Plan,
    Execute,
    Verify,
    Qa,
    CrossQa,
    Pr,
    Terminal,
}

/// Per-worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub qa_commands: Vec<String>,
    pub base_branch: String,
    pub create_prs: bool,
    pub cross_verify: bool,
    /// Bypass worktree and PR; work directly in the repository
    pub direct: bool,
    pub agent_timeout_ms: u64,
    pub qa_timeout: Duration,
    /// Plan rejections tolerated before blocking for a human
    pub max_plan_rejections: u32,
    pub spindle: SpindleConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            qa_commands: Vec::new(),
            base_branch: "main".to_string(),
            create_prs: true,
            cross_verify: false,
            direct: false,
            agent_timeout_ms: 20 * 60 * 1000,
            qa_timeout: Duration::from_secs(60),
            max_plan_rejections: 3,
            spindle: SpindleConfig::default(),
        }
    }
}

/// Final report from a worker
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub ticket_id: String,
    pub status: TicketStatus,
    pub failure: Option<FailureReason>,
    pub pr: Option<PrInfo>,
    pub was_retried: bool,
    pub changed_files: Vec<String>,
    pub lines_changed: u32,
    pub diff: Option<String>,
}

/// One ticket's worker
pub struct TicketWorker {
    ticket: Ticket,
    policy: ScopePolicy,
    repo_root: PathBuf,
    worktree: PathBuf,
    backend: Arc<dyn ExecBackend>,
    git: Arc<dyn Git>,
    runner: Arc<dyn CommandRunner>,
    baseline: QaBaseline,
    config: WorkerConfig,
    events: mpsc::Sender<TicketEvent>,
    base_prompt: PromptBuilder,
    spindle: SpindleState,
    phase: WorkerPhase,
    was_retried: bool,
}

impl TicketWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticket: Ticket,
        policy: ScopePolicy,
        repo_root: PathBuf,
        worktree: PathBuf,
        backend: Arc<dyn ExecBackend>,
        git: Arc<dyn Git>,
        runner: Arc<dyn CommandRunner>,
        baseline: QaBaseline,
        config: WorkerConfig,
        events: mpsc::Sender<TicketEvent>,
        base_prompt: PromptBuilder,
    ) -> Self {
        Self {
            ticket,
            policy,
            repo_root,
            worktree,
            backend,
            git,
            runner,
            baseline,
            config,
            events,
            base_prompt,
            spindle: SpindleState::default(),
            phase: WorkerPhase::Init,
            was_retried: false,
        }
    }

    fn enter(&mut self, phase: WorkerPhase) {
        debug!(ticket = %self.ticket.id, ?phase, "Phase transition");
        self.phase = phase;
    }

    /// Current phase, for worker records
    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    async fn emit(&self, kind: EventType, payload: serde_json::Value) {
        let _ = self
            .events
            .send(TicketEvent {
                ticket_id: self.ticket.id.clone(),
                kind,
                payload,
            })
            .await;
    }

    fn branch_name(&self) -> String {
        format!("flywheel/{}", self.ticket.id)
    }

    fn goal_block(&self) -> String {
        format!(
            "Ticket: {}\n{}\nCategory: {}\nAcceptance: deliver the change inside the allowed paths.",
            self.ticket.title, self.ticket.description, self.ticket.category
        )
    }

    fn prompt_for(&self, phase_hint: &str) -> String {
        let mut builder = self
            .base_prompt
            .clone()
            .set(PromptBlock::Goal, self.goal_block())
            .set(
                PromptBlock::Metadata,
                format!(
                    "{}\nAuto-approved tools: {}",
                    serialize_for_prompt(&self.policy),
                    self.policy.auto_approve_patterns.join(", ")
                ),
            )
            .set(PromptBlock::Hints, phase_hint.to_string());

        if self.config.create_prs && !self.config.direct {
            builder = builder.set(
                PromptBlock::Escalation,
                rebase_instructions(&self.config.base_branch),
            );
        }
        builder.build()
    }

    async fn call_agent(&self, prompt: String) -> Result<AgentResponse, FailureReason> {
        let request = AgentRequest::new(&self.worktree, prompt, self.config.agent_timeout_ms);
        self.backend.run(request).await.map_err(|e| {
            warn!(ticket = %self.ticket.id, error = %e, "Agent call failed");
            FailureReason::Shutdown
        })
    }

    /// Spindle check between turns; `Err` carries the abort reason.
    fn spindle_check(&mut self, response: &AgentResponse) -> Result<(), FailureReason> {
        let output = response.stdout.clone().unwrap_or_default();
        let diff = response.diff.clone().unwrap_or_default();
        let verdict = check_spindle_loop(&output, &diff, &mut self.spindle, &self.config.spindle);
        if verdict.should_abort {
            let reason = verdict.reason.expect("abort carries a reason");
            warn!(ticket = %self.ticket.id, %reason, confidence = verdict.confidence,
                "Spindle abort");
            return Err(FailureReason::SpindleAbort { reason });
        }
        Ok(())
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// PLAN: collect a plan the policy accepts; high risk blocks for a
    /// human, repeated rejection blocks too.
    async fn phase_plan(&mut self) -> Result<Option<AgentPlan>, FailureReason> {
        if !self.policy.plan_required && self.ticket.category == ProposalCategory::Docs {
            debug!(ticket = %self.ticket.id, "Docs ticket, skipping plan");
            return Ok(None);
        }
        if !self.policy.plan_required {
            return Ok(None);
        }

        let mut rejections = 0u32;
        let mut hint = "Submit a plan as JSON: {\"files_to_touch\": [{\"path\", \"action\", \"reason\"}], \"expected_tests\": [], \"risk_level\": \"low|medium|high\", \"estimated_lines\": n}".to_string();

        loop {
            let response = self.call_agent(self.prompt_for(&hint)).await?;
            let text = response.stdout.clone().unwrap_or_default();

            let Some(plan) = parse_json_payload::<AgentPlan>(&text) else {
                rejections += 1;
                if rejections > self.config.max_plan_rejections {
                    return Err(FailureReason::PlanRejected);
                }
                hint = "The previous response contained no parseable plan JSON. Submit the plan again.".to_string();
                continue;
            };

            self.emit(
                EventType::PlanSubmitted,
                json!({
                    "files": plan.paths(),
                    "risk_level": plan.risk_level,
                    "estimated_lines": plan.estimated_lines,
                }),
            )
            .await;

            if plan.risk_level == PlanRisk::High {
                info!(ticket = %self.ticket.id, "High-risk plan, blocking for human");
                return Err(FailureReason::PlanRejected);
            }

            match validate_plan_scope(&plan, &self.policy) {
                Ok(()) => {
                    self.emit(EventType::PlanApproved, json!({"files": plan.paths()}))
                        .await;
                    return Ok(Some(plan));
                }
                Err(rejection) => {
                    rejections += 1;
                    self.emit(
                        EventType::PlanRejected,
                        json!({"reason": rejection.to_string(), "attempt": rejections}),
                    )
                    .await;
                    if rejections > self.config.max_plan_rejections {
                        return Err(FailureReason::PlanRejected);
                    }
                    hint = format!("Plan rejected: {rejection}. Submit a corrected plan.");
                }
            }
        }
    }

    /// EXECUTE: run the agent, enforce scope and line budgets, spindle-
    /// check the turn. Allows one scope expansion and one line-budget
    /// resubmission.
    async fn phase_execute(
        &mut self,
        plan: Option<&AgentPlan>,
    ) -> Result<AgentResponse, FailureReason> {
        let mut hint = "Implement the ticket now. Report changed files, line counts and a unified diff as JSON.".to_string();
        let mut scope_expanded = false;
        let mut line_rejected = false;

        loop {
            let response = self.call_agent(self.prompt_for(&hint)).await?;
            self.spindle_check(&response)?;

            self.emit(
                EventType::TicketResult,
                json!({
                    "status": response.status,
                    "changed_files": response.changed_files,
                    "lines_added": response.lines_added,
                    "lines_removed": response.lines_removed,
                    "diff": response.diff,
                }),
            )
            .await;

            if response.status == AgentStatus::NeedsHuman {
                return Err(FailureReason::PlanRejected);
            }

            // Surprise files: changed but not planned (or not allowed).
            let planned: HashSet<String> = plan
                .map(|p| p.paths().into_iter().collect())
                .unwrap_or_default();
            let surprises: Vec<String> = response
                .changed_files
                .iter()
                .filter(|f| {
                    if plan.is_some() {
                        !planned.contains(*f)
                    } else {
                        !is_file_allowed(f, &self.policy)
                    }
                })
                .cloned()
                .collect();

            if !surprises.is_empty() {
                self.emit(EventType::ScopeBlocked, json!({"surprise_files": surprises}))
                    .await;
                if scope_expanded {
                    return Err(FailureReason::ScopeViolation);
                }
                // Expand once: admit the surprise files' directories.
                for surprise in &surprises {
                    if let Some(parent) = Path::new(surprise).parent() {
                        let dir = parent.to_string_lossy().replace('\\', "/");
                        if !dir.is_empty() {
                            self.policy.allowed_paths.push(format!("{dir}/**"));
                        }
                    }
                }
                scope_expanded = true;
                self.was_retried = true;
                hint = format!(
                    "Scope violation: you touched {} outside the plan. Revert anything out of scope, then resubmit the result.",
                    surprises.join(", ")
                );
                continue;
            }

            // Line budget.
            if response.total_lines() > self.policy.max_lines {
                if line_rejected {
                    return Err(FailureReason::LineBudget);
                }
                line_rejected = true;
                self.was_retried = true;
                hint = format!(
                    "Change too large: {} lines against a budget of {}. Trim the change and resubmit.",
                    response.total_lines(),
                    self.policy.max_lines
                );
                continue;
            }

            return Ok(response);
        }
    }

    /// VERIFY: fast verifiers with one agent fix round. Persistent
    /// failures fall through to QA, which fails authoritatively.
    async fn phase_verify(&mut self) -> Result<(), FailureReason> {
        let verifiers = fast_verifiers(&self.config.qa_commands);
        if verifiers.is_empty() {
            return Ok(());
        }

        let pass = run_qa_pass(
            &verifiers,
            &self.baseline,
            self.runner.as_ref(),
            &self.worktree,
            self.config.qa_timeout,
        )
        .await;

        if pass.all_green() {
            return Ok(());
        }

        let excerpts: Vec<String> = pass
            .counting_failures()
            .iter()
            .map(|r| {
                format!(
                    "$ {}\n{}",
                    r.command,
                    r.output_excerpt.clone().unwrap_or_default()
                )
            })
            .collect();

        let hint = format!(
            "Fast verification failed. Fix these without expanding scope:\n{}",
            excerpts.join("\n")
        );
        let response = self.call_agent(self.prompt_for(&hint)).await?;
        self.spindle_check(&response)?;

        // Re-run once; persistence is QA's problem.
        let _ = run_qa_pass(
            &verifiers,
            &self.baseline,
            self.runner.as_ref(),
            &self.worktree,
            self.config.qa_timeout,
        )
        .await;
        Ok(())
    }

    /// QA: run everything; retry per failure class with the agent fixing
    /// between rounds.
    async fn phase_qa(&mut self) -> Result<(), FailureReason> {
        if self.config.qa_commands.is_empty() {
            return Ok(());
        }

        let mut attempts_by_class: std::collections::HashMap<QaErrorClass, u32> =
            std::collections::HashMap::new();

        loop {
            let pass = run_qa_pass(
                &self.config.qa_commands,
                &self.baseline,
                self.runner.as_ref(),
                &self.worktree,
                self.config.qa_timeout,
            )
            .await;

            for result in &pass.results {
                self.emit(
                    EventType::QaCommandResult,
                    json!({
                        "command": result.command,
                        "passed": result.passed,
                        "pre_existing": result.pre_existing,
                        "class": result.class,
                    }),
                )
                .await;
            }

            if pass.all_green() {
                self.emit(EventType::QaPassed, json!({})).await;
                return Ok(());
            }

            let class = pass.dominant_class().unwrap_or(QaErrorClass::Unknown);
            let attempts = attempts_by_class.entry(class).or_insert(0);
            *attempts += 1;

            if *attempts > class.max_retries() {
                let failures: Vec<&str> = pass
                    .counting_failures()
                    .iter()
                    .map(|r| r.command.as_str())
                    .collect();
                self.emit(
                    EventType::QaFailed,
                    json!({"class": class, "commands": failures}),
                )
                .await;
                return Err(FailureReason::QaFailed { class });
            }

            self.was_retried = true;
            let excerpts: Vec<String> = pass
                .counting_failures()
                .iter()
                .map(|r| {
                    let excerpt = r.output_excerpt.clone().unwrap_or_default();
                    let excerpt: String = excerpt.chars().take(QA_EXCERPT_CHARS).collect();
                    format!("$ {}\n{}", r.command, excerpt)
                })
                .collect();
            let hint = format!(
                "QA failed ({class}). Fix the failures and keep the change within scope:\n{}",
                excerpts.join("\n")
            );
            let response = self.call_agent(self.prompt_for(&hint)).await?;
            self.spindle_check(&response)?;
        }
    }

    /// CROSS_QA: re-run QA in a fresh checkout to catch state leaked
    /// between command invocations.
    async fn phase_cross_qa(&mut self) -> Result<(), FailureReason> {
        if !self.config.cross_verify {
            return Ok(());
        }

        let clean = self
            .worktree
            .parent()
            .unwrap_or(&self.repo_root)
            .join(format!("{}-crossqa", self.ticket.id));
        let branch = format!("{}-crossqa", self.branch_name());

        if self
            .git
            .worktree_add(&self.repo_root, &clean, &branch)
            .is_err()
        {
            // Cross-verify is best-effort; a worktree failure does not
            // block the ticket.
            return Ok(());
        }

        let pass = run_qa_pass(
            &self.config.qa_commands,
            &self.baseline,
            self.runner.as_ref(),
            &clean,
            self.config.qa_timeout,
        )
        .await;

        let _ = self.git.worktree_remove(&self.repo_root, &clean);
        let _ = self.git.delete_branch(&self.repo_root, &branch);

        if pass.all_green() {
            Ok(())
        } else {
            Err(FailureReason::QaFailed {
                class: pass.dominant_class().unwrap_or(QaErrorClass::Unknown),
            })
        }
    }

    /// PR: rebase, push, open. Failure is terminal for the ticket.
    async fn phase_pr(&mut self) -> Result<Option<PrInfo>, FailureReason> {
        if !self.config.create_prs || self.config.direct {
            return Ok(None);
        }

        self.git
            .rebase_onto(&self.worktree, "origin", &self.config.base_branch)
            .map_err(|e| {
                warn!(ticket = %self.ticket.id, error = %e, "Rebase failed");
                FailureReason::PrFailed
            })?;
        self.git
            .push(&self.worktree, &self.branch_name())
            .map_err(|e| {
                warn!(ticket = %self.ticket.id, error = %e, "Push failed");
                FailureReason::PrFailed
            })?;

        let body = format!(
            "{}\n\nCategory: {}\nTicket: {}",
            self.ticket.description, self.ticket.category, self.ticket.id
        );
        let pr = self
            .git
            .open_pr(
                &self.worktree,
                &self.ticket.title,
                &body,
                &self.config.base_branch,
            )
            .map_err(|e| {
                warn!(ticket = %self.ticket.id, error = %e, "PR creation failed");
                FailureReason::PrFailed
            })?;

        self.emit(
            EventType::PrCreated,
            json!({"number": pr.number, "url": pr.url, "branch": pr.branch}),
        )
        .await;
        Ok(Some(pr))
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Run the ticket to a terminal state.
    pub async fn run(mut self) -> WorkerOutcome {
        let ticket_id = self.ticket.id.clone();

        // Worktree setup; direct mode works the repository in place.
        if self.config.direct {
            self.worktree = self.repo_root.clone();
        } else {
            if let Err(e) = self
                .git
                .worktree_add(&self.repo_root, &self.worktree, &self.branch_name())
            {
                warn!(ticket = %ticket_id, error = %e, "Worktree setup failed");
                return WorkerOutcome {
                    ticket_id,
                    status: TicketStatus::Blocked,
                    failure: Some(FailureReason::PrFailed),
                    pr: None,
                    was_retried: false,
                    changed_files: Vec::new(),
                    lines_changed: 0,
                    diff: None,
                };
            }
            self.policy.worktree_root = Some(self.worktree.clone());
        }

        let result = self.drive().await;

        match result {
            Ok((pr, response)) => WorkerOutcome {
                ticket_id,
                status: TicketStatus::Done,
                failure: None,
                pr,
                was_retried: self.was_retried,
                lines_changed: response.total_lines(),
                changed_files: response.changed_files,
                diff: response.diff,
            },
            Err(failure) => {
                let status = match failure {
                    FailureReason::Shutdown => TicketStatus::Aborted,
                    _ => TicketStatus::Blocked,
                };
                WorkerOutcome {
                    ticket_id,
                    status,
                    failure: Some(failure),
                    pr: None,
                    was_retried: self.was_retried,
                    changed_files: Vec::new(),
                    lines_changed: 0,
                    diff: None,
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<(Option<PrInfo>, AgentResponse), FailureReason> {
        self.enter(WorkerPhase::Plan);
        let plan = self.phase_plan().await?;
        self.enter(WorkerPhase::Execute);
        let mut response = self.phase_execute(plan.as_ref()).await?;

        let mut cross_retried = false;
        loop {
            self.enter(WorkerPhase::Verify);
            self.phase_verify().await?;
            self.enter(WorkerPhase::Qa);
            self.phase_qa().await?;
            self.enter(WorkerPhase::CrossQa);
            match self.phase_cross_qa().await {
                Ok(()) => break,
                // State leaked between commands: one more execute round
                // in the dirty worktree, then give up.
                Err(failure) if !cross_retried => {
                    warn!(ticket = %self.ticket.id, %failure,
                        "Cross-QA failed in clean checkout, returning to execute");
                    cross_retried = true;
                    self.was_retried = true;
                    self.enter(WorkerPhase::Execute);
                    response = self.phase_execute(plan.as_ref()).await?;
                }
                Err(failure) => return Err(failure),
            }
        }

        self.enter(WorkerPhase::Pr);
        let pr = self.phase_pr().await?;
        self.enter(WorkerPhase::Terminal);
        Ok((pr, response))
    }
}
