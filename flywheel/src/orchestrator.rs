//! Cycle orchestrator
//!
//! The outer control loop. Per cycle: pre-cycle maintenance → scout →
//! proposal pipeline → execution batch → post-cycle maintenance. The
//! orchestrator owns the session state, drains the worker event channel
//! at maintenance points, and sets a shutdown reason when a terminal
//! condition fires rather than unwinding across the loop boundary.

use crate::adaptive::{evaluate_convergence, ConvergenceAction, ConvergenceInputs};
use crate::backend::{parse_json_payload, AgentRequest, ExecBackend};
use crate::command::CommandRunner;
use crate::config::{PullPolicy, WheelConfig};
use crate::error::OrchestratorResult;
use crate::git::{Git, PullOutcome};
use crate::index::CodebaseIndex;
use crate::learnings::{Learning, LearningCategory, LearningStore};
use crate::proposals::{
    run_pipeline, Blueprint, DedupContext, DedupMemory, Proposal, ProposalCategory,
    ProposalPipelineConfig,
};
use crate::scope::{derive_policy, ScopePolicyInput};
use crate::sectors::{default_lenses, LensRotation, SectorScheduler};
use crate::session::{
    effective_min_confidence, pr_backpressure_pause, CycleSummary, PrRecord, SessionPhase,
    SessionState, ShutdownReason,
};
use crate::store::{ArtifactLog, EventLog, EventType};
use crate::tickets::{Ticket, TicketRepo, TicketStatus};
use crate::trajectory::{
    AdvanceOutcome, Trajectory, TrajectoryEngine, TrajectoryState, TrajectoryStatus,
    TrajectoryStep,
};
use crate::worker::{
    select_batch, QaBaseline, TicketEvent, TicketWorker, WorkerConfig, WorkerOutcome,
    PromptBlock, PromptBuilder,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Zero-completion cycles tolerated before low-yield shutdown
const LOW_YIELD_CYCLES: u32 = 3;

/// The tolerance stretches under an active trajectory
const LOW_YIELD_CYCLES_TRAJECTORY: u32 = 5;

/// Taste profile rebuild cadence (cycles)
const TASTE_REBUILD_EVERY: u64 = 10;

/// Learning consolidation cadence (cycles)
const CONSOLIDATE_EVERY: u64 = 5;

/// Inter-cycle and backpressure pacing; tests zero these out
#[derive(Debug, Clone)]
pub struct Pacing {
    pub inter_cycle: Duration,
    pub inter_cycle_trajectory: Duration,
    pub backpressure: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            inter_cycle: Duration::from_secs(5),
            inter_cycle_trajectory: Duration::from_secs(1),
            backpressure: Duration::from_secs(15),
        }
    }
}

/// The orchestrator
pub struct Orchestrator {
    config: WheelConfig,
    pub session: SessionState,
    backend: Arc<dyn ExecBackend>,
    git: Arc<dyn Git>,
    repo: Arc<dyn TicketRepo>,
    runner: Arc<dyn CommandRunner>,
    scheduler: SectorScheduler,
    lenses: LensRotation,
    engine: TrajectoryEngine,
    index: CodebaseIndex,
    learnings: LearningStore,
    dedup: DedupMemory,
    baseline: QaBaseline,
    event_log: EventLog,
    events_tx: mpsc::Sender<TicketEvent>,
    events_rx: mpsc::Receiver<TicketEvent>,
    active_trajectory: Option<(Trajectory, TrajectoryState)>,
    blueprint: Option<(Blueprint, Vec<Proposal>)>,
    taste_block: String,
    user_signal: Arc<AtomicBool>,
    pub pacing: Pacing,
}

impl Orchestrator {
    /// Wire up a session over a repository.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: PathBuf,
        config: WheelConfig,
        backend: Arc<dyn ExecBackend>,
        git: Arc<dyn Git>,
        repo: Arc<dyn TicketRepo>,
        runner: Arc<dyn CommandRunner>,
        user_signal: Arc<AtomicBool>,
    ) -> OrchestratorResult<Self> {
        let mut session = SessionState::new(repo_root.clone(), &config);
        session.restore()?;

        let state_dir = session.state_dir.clone();
        let prior_cache = CodebaseIndex::load_cache(&state_dir.join("ast-cache.json"))?;
        let index = CodebaseIndex::build(&repo_root, prior_cache);
        let scheduler = SectorScheduler::load(&state_dir.join("sectors.json"), &index)?;
        let learnings = LearningStore::load(&state_dir.join("learnings.json"))?;
        let dedup = DedupMemory::load(&state_dir.join("dedup-memory.json"))?;
        let baseline = QaBaseline::load(&state_dir.join("qa-baseline.json"))?;
        let event_log = EventLog::open(&session.run_dir(), session.run_id.clone())?;
        let engine = TrajectoryEngine::new(&state_dir, Default::default());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            session,
            backend,
            git,
            repo,
            runner,
            scheduler,
            lenses: LensRotation::new(default_lenses()),
            engine,
            index,
            learnings,
            dedup,
            baseline,
            event_log,
            events_tx,
            events_rx,
            active_trajectory: None,
            blueprint: None,
            taste_block: String::new(),
            user_signal,
            pacing: Pacing::default(),
        })
    }

    fn trajectory_guided(&self) -> bool {
        self.active_trajectory
            .as_ref()
            .map(|(_, s)| s.status == TrajectoryStatus::Active && !s.paused)
            .unwrap_or(false)
    }

    fn record_event(&mut self, kind: EventType, payload: serde_json::Value) {
        if let Err(e) = self.event_log.append(kind, payload) {
            warn!(error = %e, "Event append failed");
        }
    }

    /// Drain the worker channel into the event log, preserving per-ticket
    /// order.
    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            let mut payload = event.payload;
            if let serde_json::Value::Object(map) = &mut payload {
                map.insert("ticket_id".to_string(), json!(event.ticket_id));
            }
            if let Err(e) = self.event_log.append(event.kind, payload) {
                warn!(error = %e, "Event append failed");
            }
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Run the session to a shutdown reason.
    pub async fn run(&mut self) -> OrchestratorResult<ShutdownReason> {
        self.startup().await?;

        loop {
            if self.user_signal.load(Ordering::Relaxed) {
                self.session.request_shutdown(ShutdownReason::UserSignal);
            }
            if let Some(reason) = self.session.shutdown {
                self.session_end_cleanup();
                return Ok(reason);
            }

            self.run_cycle().await;

            let sleep = if self.trajectory_guided() {
                self.pacing.inter_cycle_trajectory
            } else {
                self.pacing.inter_cycle
            };
            tokio::time::sleep(sleep).await;
        }
    }

    async fn startup(&mut self) -> OrchestratorResult<()> {
        std::fs::create_dir_all(self.session.run_dir()).ok();

        // Capture the QA baseline once per repository.
        if self.baseline.timestamp.is_none() && !self.config.qa_commands.is_empty() {
            self.baseline = QaBaseline::capture(
                &self.config.qa_commands,
                self.runner.as_ref(),
                &self.session.repo_root,
                Duration::from_secs(60),
            )
            .await;
            self.persist_baseline();
        }

        // Resume an active trajectory and pre-verify its steps.
        if let Some(state) = self.engine.load_state()? {
            if state.status == TrajectoryStatus::Active {
                let trajectories = crate::trajectory::load_valid_trajectories(&self.engine);
                if let Some(trajectory) = trajectories
                    .into_iter()
                    .find(|t| t.name == state.trajectory_name)
                {
                    let mut state = state;
                    let advanced = self
                        .engine
                        .pre_verify_and_advance(
                            &trajectory,
                            &mut state,
                            self.runner.as_ref(),
                            &self.session.repo_root,
                        )
                        .await;
                    if advanced > 0 {
                        info!(advanced, "Pre-verify auto-advanced trajectory steps");
                    }
                    self.engine.save_state(&state)?;
                    if state.status == TrajectoryStatus::Active {
                        self.active_trajectory = Some((trajectory, state));
                    }
                }
            }
        }

        Ok(())
    }

    fn persist_baseline(&self) {
        let path = self.session.state_dir.join("qa-baseline.json");
        if let Err(e) = self.baseline.save(&path) {
            warn!(error = %e, "Baseline persist failed");
        }
    }

    // =========================================================================
    // One cycle
    // =========================================================================

    async fn run_cycle(&mut self) {
        if !self.pre_cycle_maintenance().await {
            return;
        }

        let cycle = self.session.cycle_count;
        info!(cycle, phase = ?self.session.phase, "Cycle start");

        let mut summary = CycleSummary {
            cycle,
            sector: None,
            formula: None,
            scope: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
            no_changes: Vec::new(),
        };

        let tickets = if self.trajectory_guided() {
            self.trajectory_tickets(&mut summary)
        } else {
            self.scout_tickets(&mut summary).await
        };

        for ticket in tickets {
            if let Err(e) = self.repo.insert(ticket) {
                warn!(error = %e, "Ticket insert failed");
            }
        }

        self.execute_batch(&mut summary).await;
        self.post_cycle_maintenance(summary).await;
    }

    /// Returns false when the cycle paused for backpressure.
    async fn pre_cycle_maintenance(&mut self) -> bool {
        self.session.cycle_count += 1;
        self.session
            .recompute_phase(self.config.budget.time_budget_minutes);

        // PR backpressure above 70%: pause and retry the cycle.
        if pr_backpressure_pause(self.session.open_prs.len(), self.config.budget.max_prs) {
            info!("PR backpressure, pausing cycle");
            self.session.cycle_count -= 1;
            tokio::time::sleep(self.pacing.backpressure).await;
            return false;
        }

        self.session.effective_min_confidence = effective_min_confidence(
            self.config.min_confidence,
            self.session.calibrator.calibration_delta(),
            self.session.phase,
            self.session.quality_rate(),
            self.session.cycle_count,
            self.session.open_prs.len(),
            self.config.budget.max_prs,
        );

        if self.session.cycle_count % TASTE_REBUILD_EVERY == 0 {
            self.taste_block = self.build_taste_profile();
        }
        if self.session.cycle_count % CONSOLIDATE_EVERY == 0 {
            self.learnings.consolidate(chrono::Utc::now());
        }

        self.periodic_git_maintenance();
        self.refresh_index_if_stale();
        self.drain_events();
        true
    }

    fn periodic_git_maintenance(&mut self) {
        // Fast-forward the base branch; divergence behaves per policy.
        match self.git.ff_pull(
            &self.session.repo_root,
            "origin",
            &self.config.base_branch,
        ) {
            Ok(PullOutcome::Diverged) => match self.config.pull_policy {
                PullPolicy::Halt => {
                    warn!("Base branch diverged, halting");
                    self.session.request_shutdown(ShutdownReason::BranchDiverged);
                }
                PullPolicy::Warn => {
                    warn!("Base branch diverged from origin, continuing");
                }
            },
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Pull skipped"),
        }

        // Poll open PRs; merged/closed feed formula stats and clean up
        // remote branches.
        let numbers: Vec<u64> = self.session.open_prs.iter().map(|p| p.info.number).collect();
        for number in numbers {
            match self.git.poll_pr(&self.session.repo_root, number) {
                Ok(state) => {
                    if let Some(record) = self.session.apply_pr_state(number, state) {
                        let _ = self
                            .git
                            .delete_remote_branch(&self.session.repo_root, &record.info.branch);
                    }
                }
                Err(e) => debug!(number, error = %e, "PR poll failed"),
            }
        }
    }

    fn refresh_index_if_stale(&mut self) {
        if self.index.is_stale(&self.session.repo_root) {
            info!("Structural change detected, rebuilding index");
            let cache = std::mem::take(&mut self.index.cache);
            self.index = CodebaseIndex::build(&self.session.repo_root, cache);
            // Re-seed sectors, merging the stats we already have.
            let sectors_path = self.session.state_dir.join("sectors.json");
            if self.scheduler.save(&sectors_path).is_ok() {
                if let Ok(scheduler) = SectorScheduler::load(&sectors_path, &self.index) {
                    self.scheduler = scheduler;
                }
            }
            let _ = self
                .index
                .save_cache(&self.session.state_dir.join("ast-cache.json"));
        }
    }

    // =========================================================================
    // Scouting
    // =========================================================================

    fn base_prompt(&self) -> PromptBuilder {
        PromptBuilder::new()
            .set(
                PromptBlock::Guidelines,
                "Work in small, verifiable increments. Never touch files outside the stated scope.",
            )
            .set(PromptBlock::Taste, self.taste_block.clone())
            .set(PromptBlock::Dedup, self.dedup.render_for_prompt(20))
            .set(
                PromptBlock::Learnings,
                self.learnings
                    .relevant_to(&["./".to_string()], chrono::Utc::now())
                    .iter()
                    .take(10)
                    .map(|l| format!("- {}", l.text))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
    }

    async fn scout_tickets(&mut self, summary: &mut CycleSummary) -> Vec<Ticket> {
        let Some((sector_path, scope)) = self.scheduler.select(self.session.cycle_count) else {
            debug!("No schedulable sector");
            return Vec::new();
        };

        let sector_paths: Vec<String> = self
            .scheduler
            .sectors()
            .iter()
            .map(|s| s.path.clone())
            .collect();
        let warmup = self.session.phase == SessionPhase::Warmup;
        let lens = match self.lenses.pick(&sector_paths, warmup) {
            Some(lens) => lens.clone(),
            None => return Vec::new(),
        };

        summary.sector = Some(sector_path.clone());
        summary.formula = Some(lens.name.clone());
        summary.scope = Some(scope.clone());

        let blueprint_block = self
            .blueprint
            .as_ref()
            .map(|(b, p)| b.render_for_prompt(p))
            .unwrap_or_default();

        let categories: Vec<String> = lens.categories.iter().map(|c| c.to_string()).collect();
        let prompt = self
            .base_prompt()
            .set(
                PromptBlock::Goal,
                format!(
                    "Scout `{scope}` for improvement proposals. Focus: {} (style: {}). {}\n\
                     Respond with a JSON array of proposals: [{{\"title\", \"description\", \"category\", \"files\", \"allowed_paths\", \"confidence\", \"impact_score\", \"estimated_complexity\", \"verification_commands\", \"acceptance_criteria\", \"rationale\"}}]",
                    categories.join(", "),
                    lens.style,
                    lens.extra_prompt
                ),
            )
            .set(PromptBlock::SectorGraph, blueprint_block)
            .build();

        let request = AgentRequest::new(
            &self.session.repo_root,
            prompt,
            self.config.budget.ticket_step_budget as u64 * 60_000,
        );
        let response = match self.backend.run(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Scout call failed");
                return Vec::new();
            }
        };

        let text = response.stdout.unwrap_or_default();
        let mut proposals = parse_scout_proposals(&text);

        // Re-inject deferred proposals that fall inside this scope.
        let deferred = std::mem::take(&mut self.session.deferred_proposals);
        for proposal in deferred {
            let paths = if proposal.allowed_paths.is_empty() {
                &proposal.files
            } else {
                &proposal.allowed_paths
            };
            if paths.iter().all(|p| crate::proposals::within_scope(p, &scope)) {
                proposals.push(proposal);
            } else {
                self.session.deferred_proposals.push(proposal);
            }
        }

        self.record_event(
            EventType::ScoutOutput,
            json!({"sector": sector_path, "formula": lens.name, "proposals": proposals.len()}),
        );

        // Record the scan against sector and lens state.
        self.scheduler.record_scan_result(
            &sector_path,
            self.session.cycle_count,
            proposals.len() as u32,
        );
        self.lenses
            .record_scan(&lens.name, &sector_path, proposals.len() as u32);
        let stats = self
            .session
            .formula_stats
            .entry(lens.name.clone())
            .or_default();
        stats.scans += 1;
        stats.proposals += proposals.len() as u32;

        self.record_event(
            EventType::ProposalsReviewed,
            json!({"count": proposals.len()}),
        );

        // Through the pipeline.
        let open_titles: Vec<String> = self
            .repo
            .list()
            .map(|tickets| {
                tickets
                    .iter()
                    .filter(|t| {
                        matches!(t.status, TicketStatus::Ready | TicketStatus::InProgress)
                    })
                    .map(|t| t.title.clone())
                    .collect()
            })
            .unwrap_or_default();
        let done: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
            .repo
            .list()
            .map(|tickets| {
                tickets
                    .iter()
                    .filter_map(|t| t.done_at.map(|at| (t.title.clone(), at)))
                    .collect()
            })
            .unwrap_or_default();

        let pipeline_config = ProposalPipelineConfig {
            min_confidence: self.config.min_confidence,
            categories: self.config.categories.clone(),
            ..Default::default()
        };
        let dedup_ctx = DedupContext {
            open_titles: &open_titles,
            done: &done,
            memory: &self.dedup,
        };
        let outcome = run_pipeline(
            proposals,
            &scope,
            &dedup_ctx,
            &self.index,
            &pipeline_config,
            self.session.effective_min_confidence,
        );

        self.record_event(
            EventType::ProposalsFiltered,
            json!({
                "accepted": outcome.accepted.len(),
                "rejected": outcome.rejected.len(),
            }),
        );

        // Out-of-scope rejects are deferred, not lost: they come back
        // when their sector is scouted.
        for (proposal, rejection) in &outcome.rejected {
            if matches!(
                rejection,
                crate::proposals::FilterRejection::OutOfScope { .. }
            ) && self
                .session
                .deferred_proposals
                .iter()
                .all(|p| p.title != proposal.title)
            {
                self.session.deferred_proposals.push(proposal.clone());
            }
        }

        // A cohesive cluster becomes a trajectory; its proposals run as
        // ordered steps over the coming cycles instead of a flat batch.
        let mut in_trajectory: std::collections::HashSet<usize> = std::collections::HashSet::new();
        if self.active_trajectory.is_none() {
            if let Some(group) = outcome
                .blueprint
                .groups
                .iter()
                .filter(|g| g.members.len() >= crate::trajectory::MIN_CLUSTER_SIZE)
                .max_by_key(|g| g.members.len())
            {
                let cluster: Vec<Proposal> = group
                    .members
                    .iter()
                    .filter_map(|&i| outcome.accepted.get(i).cloned())
                    .collect();
                let ambition = crate::adaptive::ambition_from_completion_rate(
                    self.session.quality_rate(),
                );
                let synthesized = crate::trajectory::synthesize_from_cluster(
                    &sector_path.replace('/', "-"),
                    chrono::Utc::now().timestamp_millis(),
                    &cluster,
                    &self.index,
                    ambition,
                );
                if let Some(mut trajectory) = synthesized {
                    self.engine
                        .apply_graph_ordering(&mut trajectory, &self.index.module_edges);
                    if let Some((trajectory, state)) = self.engine.activate(trajectory) {
                        info!(name = %trajectory.name, steps = trajectory.steps.len(),
                            "Activated synthesized trajectory");
                        let _ = crate::trajectory::save_trajectory_yaml(
                            &self.session.state_dir,
                            &trajectory,
                        );
                        let _ = self.engine.save_state(&state);
                        in_trajectory.extend(group.members.iter().copied());
                        self.active_trajectory = Some((trajectory, state));
                    }
                }
            }
        }

        let tickets = outcome
            .accepted
            .iter()
            .enumerate()
            .filter(|(i, _)| !in_trajectory.contains(i))
            .map(|(_, p)| Ticket::from_proposal(p, (p.weighted_impact() * 10.0) as u32))
            .collect();
        self.blueprint = Some((outcome.blueprint, outcome.accepted));
        tickets
    }

    // =========================================================================
    // Trajectory-guided work
    // =========================================================================

    fn step_ticket(step: &TrajectoryStep) -> Ticket {
        let category = step
            .categories
            .first()
            .and_then(|c| serde_json::from_value(json!(c)).ok())
            .unwrap_or(ProposalCategory::Refactor);
        Ticket {
            id: format!("tkt-{}", uuid::Uuid::new_v4()),
            title: step.title.clone(),
            description: step.description.clone(),
            category,
            allowed_paths: step.scope.iter().cloned().collect(),
            verification_commands: step.verification_commands.clone(),
            status: TicketStatus::Ready,
            priority: u32::from(step.priority()) * 10,
            created_at: chrono::Utc::now(),
            done_at: None,
            trajectory_step: Some(step.id.clone()),
        }
    }

    fn trajectory_tickets(&mut self, summary: &mut CycleSummary) -> Vec<Ticket> {
        let Some((trajectory, state)) = &self.active_trajectory else {
            return Vec::new();
        };

        let current = state
            .current_step_id
            .clone()
            .or_else(|| self.engine.get_next_step(trajectory, state).map(|s| s.id.clone()));
        let Some(step_id) = current else {
            return Vec::new();
        };
        let Some(step) = trajectory.step(&step_id) else {
            return Vec::new();
        };

        summary.sector = step.scope.clone();
        summary.scope = step.scope.clone();
        summary.formula = Some(format!("trajectory:{}", trajectory.name));

        // One ticket per step at a time.
        let already_open = self
            .repo
            .list()
            .map(|tickets| {
                tickets.iter().any(|t| {
                    t.trajectory_step.as_deref() == Some(step_id.as_str())
                        && !t.status.is_terminal()
                })
            })
            .unwrap_or(false);
        if already_open {
            return Vec::new();
        }

        vec![Self::step_ticket(step)]
    }

    async fn progress_trajectory(&mut self) {
        let Some((trajectory, mut state)) = self.active_trajectory.take() else {
            return;
        };

        let outcome = self
            .engine
            .advance(
                &trajectory,
                &mut state,
                self.session.cycle_count,
                self.runner.as_ref(),
                &self.session.repo_root,
            )
            .await;

        match &outcome {
            AdvanceOutcome::StepCompleted { step_id, .. } => {
                info!(step = %step_id, "Trajectory step verified complete");
            }
            AdvanceOutcome::StepFailed { step_id, stuck } => {
                debug!(step = %step_id, stuck, "Trajectory step not yet verified");
            }
            AdvanceOutcome::TrajectoryEnded { outcome } => {
                info!(?outcome, "Trajectory ended");
            }
            AdvanceOutcome::Idle => {}
        }

        if let Err(e) = self.engine.save_state(&state) {
            warn!(error = %e, "Trajectory state persist failed");
        }
        if state.status == TrajectoryStatus::Active {
            self.active_trajectory = Some((trajectory, state));
        }
    }

    // =========================================================================
    // Execution batch
    // =========================================================================

    async fn execute_batch(&mut self, summary: &mut CycleSummary) {
        let ready = match self.repo.list_by_status(TicketStatus::Ready) {
            Ok(tickets) => tickets,
            Err(e) => {
                warn!(error = %e, "Ticket listing failed");
                return;
            }
        };
        if ready.is_empty() {
            return;
        }

        let cap = self.config.budget.parallel.min(ready.len()).max(1);
        let batch = select_batch(ready, cap);

        if !batch.deferred.is_empty() {
            self.record_event(
                EventType::ParallelDeconflicted,
                json!({
                    "skipped": batch.deferred.len(),
                    "tickets": batch.deferred.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
                }),
            );
        }

        let mut futures = Vec::new();
        for ticket in batch.accepted {
            if self.user_signal.load(Ordering::Relaxed) {
                break;
            }
            match self.repo.transition(&ticket.id, TicketStatus::InProgress) {
                Ok(ticket) => futures.push(self.spawn_worker(ticket)),
                Err(e) => warn!(error = %e, "Ticket transition failed"),
            }
        }

        let outcomes = futures::future::join_all(futures).await;
        self.drain_events();

        for outcome in outcomes {
            self.apply_worker_outcome(outcome, summary);
        }
    }

    fn spawn_worker(
        &self,
        ticket: Ticket,
    ) -> impl std::future::Future<Output = WorkerOutcome> + Send {
        let policy = derive_policy(ScopePolicyInput {
            allowed_paths: ticket.allowed_paths.clone(),
            category: ticket.category,
            max_lines_per_ticket: self.config.max_lines_per_ticket,
            learnings: &self.learnings.items,
            worktree_root: None,
        });

        let worktree = self
            .session
            .state_dir
            .join("worktrees")
            .join(&ticket.id);

        let worker_config = WorkerConfig {
            qa_commands: self.config.qa_commands.clone(),
            base_branch: self.config.base_branch.clone(),
            create_prs: self.config.create_prs,
            cross_verify: self.config.cross_verify,
            direct: self.config.direct,
            agent_timeout_ms: self.config.budget.ticket_step_budget as u64 * 60_000,
            qa_timeout: Duration::from_secs(60),
            max_plan_rejections: 3,
            spindle: self.config.spindle.clone(),
        };

        let worker = TicketWorker::new(
            ticket,
            policy,
            self.session.repo_root.clone(),
            worktree,
            self.backend.clone(),
            self.git.clone(),
            self.runner.clone(),
            self.baseline.clone(),
            worker_config,
            self.events_tx.clone(),
            self.base_prompt(),
        );
        worker.run()
    }

    fn apply_worker_outcome(&mut self, outcome: WorkerOutcome, summary: &mut CycleSummary) {
        let ticket = match self.repo.get(&outcome.ticket_id) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Outcome for unknown ticket");
                return;
            }
        };

        if let Err(e) = self.repo.transition(&outcome.ticket_id, outcome.status) {
            warn!(error = %e, "Outcome transition failed");
        }

        let succeeded = outcome.status == TicketStatus::Done;
        self.session.worker_records.push(crate::session::WorkerRecord {
            ticket_id: outcome.ticket_id.clone(),
            title: ticket.title.clone(),
            succeeded,
            failure: outcome.failure.as_ref().map(|f| f.to_string()),
            was_retried: outcome.was_retried,
            lines_changed: outcome.lines_changed,
            finished_at: chrono::Utc::now(),
        });
        if let Some(diff) = &outcome.diff {
            self.session.record_diff(diff.clone());
        }

        if succeeded {
            if outcome.changed_files.is_empty() {
                summary.no_changes.push(ticket.title.clone());
            } else {
                summary.succeeded.push(ticket.title.clone());
            }
            self.session.tickets_succeeded += 1;
            self.dedup.remember(&ticket.title, "done");
        } else {
            summary.failed.push(ticket.title.clone());
            self.session.tickets_failed += 1;
            if let Some(failure) = &outcome.failure {
                self.learnings.add(
                    Learning::new(
                        format!("Ticket '{}' failed: {failure}", ticket.title),
                        LearningCategory::Warning,
                        25.0,
                    )
                    .with_tags(ticket.allowed_paths.clone()),
                );
            }
        }

        // Calibration feeds on stated confidence; tickets carry priority
        // derived from it, so reverse the mapping approximately.
        let confidence = (ticket.priority * 2).min(100) as u8;
        self.session.calibrator.record(confidence, succeeded);

        // Sector stats.
        if let Some(sector) = summary.sector.clone() {
            self.scheduler
                .record_ticket_outcome(&sector, &ticket.category.to_string(), succeeded);
        }

        if let Some(pr) = outcome.pr {
            self.session.prs_opened_total += 1;
            if let Some(formula) = &summary.formula {
                self.session
                    .formula_stats
                    .entry(formula.clone())
                    .or_default()
                    .prs_opened += 1;
            }
            self.session.open_prs.push(PrRecord {
                info: pr,
                formula: summary.formula.clone(),
                opened_at: chrono::Utc::now(),
            });
        }

        let artifacts = ArtifactLog::new(self.session.run_dir());
        let _ = artifacts.write(
            "ticket",
            &outcome.ticket_id,
            1,
            &json!({
                "status": format!("{}", outcome.status),
                "failure": outcome.failure.as_ref().map(|f| f.to_string()),
                "was_retried": outcome.was_retried,
                "changed_files": outcome.changed_files,
                "lines_changed": outcome.lines_changed,
            }),
        );
    }

    // =========================================================================
    // Post-cycle maintenance
    // =========================================================================

    async fn post_cycle_maintenance(&mut self, summary: CycleSummary) {
        let completions = summary.succeeded.len();
        self.drain_events();

        // Persist sector state.
        if let Err(e) = self
            .scheduler
            .save(&self.session.state_dir.join("sectors.json"))
        {
            warn!(error = %e, "Sector persist failed");
        }

        // Baseline healing with a learning per healed command.
        let healed = self
            .baseline
            .heal(
                self.runner.as_ref(),
                &self.session.repo_root,
                Duration::from_secs(60),
            )
            .await;
        for command in &healed {
            self.learnings.add(Learning::new(
                format!("Previously failing command now passes: {command}"),
                LearningCategory::Pattern,
                20.0,
            ));
        }
        if !healed.is_empty() {
            self.persist_baseline();
        }

        self.extract_meta_learnings(&summary);
        self.session.record_cycle_summary(summary);

        // Low-yield tracking.
        if completions == 0 {
            self.session.consecutive_low_yield += 1;
        } else {
            self.session.consecutive_low_yield = 0;
        }
        let low_yield_limit = if self.trajectory_guided() {
            LOW_YIELD_CYCLES_TRAJECTORY
        } else {
            LOW_YIELD_CYCLES
        };
        if self.session.consecutive_low_yield >= low_yield_limit {
            self.session.request_shutdown(ShutdownReason::LowYield);
        }

        // Convergence.
        let inputs = ConvergenceInputs {
            sector_coverage: self.scheduler.coverage(),
            recent_yield: self.session.recent_yield(),
            trajectory_completion_rate: self
                .active_trajectory
                .as_ref()
                .map(|(_, s)| s.completion_pct() / 100.0)
                .unwrap_or(1.0),
            pr_merge_rate: self.session.pr_merge_rate(),
        };
        let report = evaluate_convergence(inputs);
        if report.action == ConvergenceAction::Stop {
            // Stop is authoritative only without meaningful trajectory
            // progress.
            let abandon = match &self.active_trajectory {
                Some((_, state)) => self
                    .engine
                    .should_abandon_for_convergence(state, inputs.trajectory_completion_rate),
                None => true,
            };
            if abandon {
                if let Some((_, mut state)) = self.active_trajectory.take() {
                    state.status = TrajectoryStatus::Abandoned;
                    state.outcome = Some(crate::trajectory::TrajectoryOutcome::ConvergenceAbandon);
                    let _ = self.engine.save_state(&state);
                }
                self.session.request_shutdown(ShutdownReason::Convergence);
            }
        }

        // Trajectory progression.
        self.progress_trajectory().await;

        // Hard caps.
        if self.session.open_prs.len() >= self.config.budget.max_prs as usize {
            self.session.request_shutdown(ShutdownReason::PrCapReached);
        }
        if self.session.cycle_count >= self.config.budget.step_budget {
            self.session.request_shutdown(ShutdownReason::BudgetExhausted);
        }

        // Persist the journals.
        if let Err(e) = self.session.persist() {
            warn!(error = %e, "Run-state persist failed");
        }
        if let Err(e) = self
            .learnings
            .save(&self.session.state_dir.join("learnings.json"))
        {
            warn!(error = %e, "Learnings persist failed");
        }
        if let Err(e) = self
            .dedup
            .save(&self.session.state_dir.join("dedup-memory.json"))
        {
            warn!(error = %e, "Dedup memory persist failed");
        }
    }

    /// Meta-learnings: repeated failure shapes across recent cycles
    /// become warnings.
    fn extract_meta_learnings(&mut self, summary: &CycleSummary) {
        if summary.failed.len() >= 2 {
            if let Some(sector) = &summary.sector {
                self.learnings.add(
                    Learning::new(
                        format!(
                            "{} tickets failed in one cycle under {sector}",
                            summary.failed.len()
                        ),
                        LearningCategory::Gotcha,
                        15.0,
                    )
                    .with_tags(vec![sector.clone()]),
                );
            }
        }
    }

    fn build_taste_profile(&self) -> String {
        let mut lines = Vec::new();
        for (formula, stats) in &self.session.formula_stats {
            if stats.scans == 0 {
                continue;
            }
            lines.push(format!(
                "- {formula}: {} proposals over {} scans, {} merged",
                stats.proposals, stats.scans, stats.prs_merged
            ));
        }
        if lines.is_empty() {
            return String::new();
        }
        lines.sort();
        format!("What has been working here:\n{}", lines.join("\n"))
    }

    // =========================================================================
    // Session end
    // =========================================================================

    /// Abort every non-terminal ticket, remove worktrees, delete local
    /// branches with no PR. Safe to call twice.
    pub fn session_end_cleanup(&mut self) {
        let tickets = match self.repo.list() {
            Ok(tickets) => tickets,
            Err(e) => {
                warn!(error = %e, "Cleanup listing failed");
                return;
            }
        };

        let pr_branches: std::collections::HashSet<String> = self
            .session
            .open_prs
            .iter()
            .map(|p| p.info.branch.clone())
            .collect();

        for ticket in tickets {
            if !ticket.status.is_terminal() {
                if let Err(e) = self.repo.transition(&ticket.id, TicketStatus::Aborted) {
                    warn!(error = %e, "Cleanup transition failed");
                }
            }

            let worktree = self
                .session
                .state_dir
                .join("worktrees")
                .join(&ticket.id);
            if worktree.exists() {
                let _ = self.git.worktree_remove(&self.session.repo_root, &worktree);
            }
            let branch = format!("flywheel/{}", ticket.id);
            if !pr_branches.contains(&branch) {
                let _ = self.git.delete_branch(&self.session.repo_root, &branch);
            }
        }

        self.drain_events();
        let _ = self.session.persist();
    }
}

/// Pull a proposal array out of mixed scout output
pub fn parse_scout_proposals(text: &str) -> Vec<Proposal> {
    for start in text.char_indices().filter(|(_, c)| *c == '[').map(|(i, _)| i) {
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<Vec<Proposal>>();
        if let Some(Ok(proposals)) = stream.next() {
            return proposals;
        }
    }
    // A single bare object is accepted too.
    parse_json_payload::<Proposal>(text)
        .map(|p| vec![p])
        .unwrap_or_default()
}
