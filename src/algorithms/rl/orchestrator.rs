//! Training orchestrator.
//!
//! Drives a set of environments against one shared [`Learner`]. Each tick
//! steps every agent of every environment once, with environments spread
//! over a fixed-size rayon pool, then records the tick latency and runs the
//! periodic jobs: exploration annealing, structural verification,
//! checkpointing and progress logging.
//!
//! ```text
//! Stopped --run()--> Running --(stop requested | step limit | shutdown)--> Stopped
//! ```
//!
//! Stopping is cooperative: the flag is checked once per tick, so the tick
//! in flight (and any sum-tree write inside it) always completes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::environment::Environment;
use super::error::{RLError, Result};
use super::metrics::{PerformanceMonitor, TrainingSnapshot};
use super::types::{Action, AgentId, Experience};
use crate::algorithms::Learner;

/// Cloneable handle that asks a running orchestrator to stop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests a stop. Idempotent; honored at the next tick boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    Stopped,
    Running,
}

/// Why [`TrainingOrchestrator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// [`StopHandle::stop`] or [`TrainingOrchestrator::stop_training`] was called.
    Requested,
    /// The requested number of ticks was reached.
    StepLimit,
    /// The learner's replay buffer was shut down.
    LearnerShutdown,
}

/// Write a checkpoint every `interval` ticks into `directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub interval: u64,
    pub directory: PathBuf,
}

impl CheckpointPolicy {
    pub fn new(interval: u64, directory: impl Into<PathBuf>) -> Self {
        Self {
            interval,
            directory: directory.into(),
        }
    }

    /// `<directory>/<algorithm>-step<NNNNNNNN>.json`
    pub fn path_for(&self, algorithm: &str, step: u64) -> PathBuf {
        self.directory.join(format!("{algorithm}-step{step:08}.json"))
    }
}

/// Linear ε annealing from `start` to `end` over `decay_steps` ticks.
///
/// For learners without an internal schedule (the tabular agent, PPO's
/// random fallback). Leave it unset for DQN, which decays ε itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplorationSchedule {
    pub start: f64,
    pub end: f64,
    pub decay_steps: u64,
}

impl ExplorationSchedule {
    pub fn rate_at(&self, step: u64) -> f64 {
        if self.decay_steps == 0 || step >= self.decay_steps {
            return self.end;
        }
        let progress = step as f64 / self.decay_steps as f64;
        self.start + (self.end - self.start) * progress
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.start) || !(0.0..=1.0).contains(&self.end) {
            return Err(RLError::InvalidConfig(format!(
                "exploration schedule endpoints must lie in [0, 1], got {} → {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Worker threads; `None` lets rayon pick one per core.
    pub worker_threads: Option<usize>,
    pub checkpoint: Option<CheckpointPolicy>,
    /// Ticks between [`Learner::verify`] calls; 0 disables verification.
    pub verify_interval: u64,
    /// Ticks between progress log lines; 0 disables them.
    pub log_interval: u64,
    pub exploration: Option<ExplorationSchedule>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            checkpoint: None,
            verify_interval: 1_000,
            log_interval: 0,
            exploration: None,
        }
    }
}

/// Summary returned when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub stop_reason: StopReason,
    /// Ticks completed since the orchestrator was created.
    pub steps: u64,
    /// Transitions delivered to the learner.
    pub transitions: u64,
    /// Agent steps skipped after a recoverable error.
    pub skipped: u64,
    pub episodes: u64,
    pub success_rate: f64,
    pub mean_episode_reward: Option<f64>,
    pub mean_episode_length: Option<f64>,
    /// Wall time of the run that produced this report.
    pub elapsed: Duration,
    pub steps_per_sec: f64,
    pub last_checkpoint: Option<PathBuf>,
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Training Report ({:?}) ===", self.stop_reason)?;
        writeln!(f, "  Steps:                {}", self.steps)?;
        writeln!(f, "  Transitions:          {}", self.transitions)?;
        writeln!(f, "  Episodes:             {}", self.episodes)?;
        writeln!(f, "  Success rate:         {:.1}%", self.success_rate * 100.0)?;
        if let Some(reward) = self.mean_episode_reward {
            writeln!(f, "  Mean episode reward:  {reward:.3}")?;
        }
        if let Some(length) = self.mean_episode_length {
            writeln!(f, "  Mean episode length:  {length:.1}")?;
        }
        writeln!(
            f,
            "  Elapsed:              {:.2}s ({:.1} steps/s)",
            self.elapsed.as_secs_f64(),
            self.steps_per_sec
        )
    }
}

/// Per-tick aggregate returned by [`TrainingOrchestrator::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickSummary {
    pub transitions: u64,
    pub skipped: u64,
    pub episodes: u64,
    pub successes: u64,
    pub episode_reward: f64,
    pub episode_steps: u64,
}

impl TickSummary {
    fn absorb(&mut self, other: &TickSummary) {
        self.transitions += other.transitions;
        self.skipped += other.skipped;
        self.episodes += other.episodes;
        self.successes += other.successes;
        self.episode_reward += other.episode_reward;
        self.episode_steps += other.episode_steps;
    }
}

struct Worker<E> {
    env: E,
    first_agent: AgentId,
    returns: Vec<f64>,
    lengths: Vec<u64>,
}

struct EpisodeEnd {
    reward: f64,
    steps: u64,
    success: bool,
}

/// Drives environments against a shared learner.
pub struct TrainingOrchestrator<A, L: ?Sized, E> {
    learner: Arc<L>,
    workers: Vec<Worker<E>>,
    config: OrchestratorConfig,
    pool: rayon::ThreadPool,
    state: OrchestratorState,
    stop: Arc<AtomicBool>,
    steps: u64,
    totals: TickSummary,
    monitor: PerformanceMonitor,
    last_checkpoint: Mutex<Option<PathBuf>>,
    _action: std::marker::PhantomData<fn() -> A>,
}

impl<A, L, E> TrainingOrchestrator<A, L, E>
where
    A: Action,
    L: Learner<A> + ?Sized,
    E: Environment<A>,
{
    /// Creates a stopped orchestrator. Agents are numbered globally in
    /// environment order, so agent `k` of environment `i` gets id
    /// `sum(num_agents of environments before i) + k`.
    pub fn new(learner: Arc<L>, environments: Vec<E>, config: OrchestratorConfig) -> Result<Self> {
        if environments.is_empty() {
            return Err(RLError::InvalidConfig("at least one environment is required".into()));
        }
        if let Some(schedule) = &config.exploration {
            schedule.validate()?;
        }
        let mut workers = Vec::with_capacity(environments.len());
        let mut next_agent = 0;
        for env in environments {
            let agents = env.num_agents();
            if agents == 0 {
                return Err(RLError::InvalidConfig("environment hosts no agents".into()));
            }
            workers.push(Worker {
                env,
                first_agent: next_agent,
                returns: vec![0.0; agents],
                lengths: vec![0; agents],
            });
            next_agent += agents;
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.unwrap_or(0))
            .thread_name(|i| format!("ludorl-worker-{i}"))
            .build()
            .map_err(|e| RLError::InvalidConfig(format!("cannot start worker pool: {e}")))?;

        Ok(Self {
            learner,
            workers,
            config,
            pool,
            state: OrchestratorState::Stopped,
            stop: Arc::new(AtomicBool::new(false)),
            steps: 0,
            totals: TickSummary::default(),
            monitor: PerformanceMonitor::default(),
            last_checkpoint: Mutex::new(None),
            _action: std::marker::PhantomData,
        })
    }

    pub fn learner(&self) -> &Arc<L> {
        &self.learner
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn num_agents(&self) -> usize {
        self.workers.iter().map(|w| w.returns.len()).sum()
    }

    pub fn environments(&self) -> impl Iterator<Item = &E> {
        self.workers.iter().map(|w| &w.env)
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Requests a cooperative stop. Idempotent. A request made while no run
    /// is active ends the next [`run`](Self::run) before its first tick.
    pub fn stop_training(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Shuts the learner's shared resources down. Idempotent. Any later
    /// [`run`](Self::run) ends with [`StopReason::LearnerShutdown`].
    pub fn shutdown(&self) {
        self.learner.shutdown();
    }

    /// Monitoring view of the current run.
    pub fn snapshot(&self) -> TrainingSnapshot {
        TrainingSnapshot::capture(self.steps, &self.monitor, &self.learner.stats())
    }

    pub fn last_checkpoint(&self) -> Option<PathBuf> {
        self.last_checkpoint.lock().clone()
    }

    /// Runs ticks until a stop is requested, `max_steps` ticks have
    /// completed (when given) or the learner shuts down.
    ///
    /// A pending stop request is consumed when the run ends, so the next
    /// call starts fresh.
    ///
    /// # Errors
    ///
    /// A fatal error (a failed structural verification, or a
    /// [`RLError::ConcurrencyViolation`] raised while stepping) halts
    /// training and is returned. Recoverable per-agent failures are logged
    /// and skipped.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<TrainingReport> {
        self.state = OrchestratorState::Running;
        let started = Instant::now();
        let first_step = self.steps;
        info!(
            agents = self.num_agents(),
            environments = self.workers.len(),
            threads = self.pool.current_num_threads(),
            algorithm = self.learner.name(),
            "training started"
        );

        let outcome = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(StopReason::Requested);
            }
            if max_steps.is_some_and(|max| self.steps - first_step >= max) {
                break Ok(StopReason::StepLimit);
            }
            match self.step() {
                Ok(_) => {}
                Err(RLError::Shutdown) => break Ok(StopReason::LearnerShutdown),
                Err(e) => break Err(e),
            }
        };
        self.stop.store(false, Ordering::Release);
        self.state = OrchestratorState::Stopped;

        match outcome {
            Ok(reason) => {
                let report = self.report(reason, started.elapsed(), self.steps - first_step);
                info!(
                    reason = ?reason,
                    steps = report.steps,
                    episodes = report.episodes,
                    success_rate = report.success_rate,
                    "training stopped"
                );
                Ok(report)
            }
            Err(e) => {
                error!(step = self.steps, error = %e, "training halted");
                Err(e)
            }
        }
    }

    /// Executes one tick: every agent of every environment acts once.
    ///
    /// # Errors
    ///
    /// [`RLError::Shutdown`] once the learner no longer accepts
    /// experience, or a fatal error from stepping or verification.
    pub fn step(&mut self) -> Result<TickSummary> {
        let started = Instant::now();
        let learner = &*self.learner;
        let workers = &mut self.workers;
        let results: Vec<(TickSummary, Option<RLError>)> = self.pool.install(|| {
            workers
                .par_iter_mut()
                .map(|w| step_worker::<A, L, E>(w, learner))
                .collect()
        });

        let mut tick = TickSummary::default();
        let mut halt = None;
        for (summary, err) in results {
            tick.absorb(&summary);
            if halt.is_none() {
                halt = err;
            }
        }
        self.totals.absorb(&tick);
        self.steps += 1;
        self.monitor.record_step(started.elapsed());

        if let Some(e) = halt {
            return Err(e);
        }
        self.after_tick()?;
        Ok(tick)
    }

    fn after_tick(&self) -> Result<()> {
        let step = self.steps;
        if let Some(schedule) = &self.config.exploration {
            self.learner.set_exploration_rate(schedule.rate_at(step))?;
        }
        if self.config.verify_interval > 0 && step % self.config.verify_interval == 0 {
            if let Err(e) = self.learner.verify() {
                error!(step, error = %e, "structural verification failed");
                return Err(e);
            }
        }
        if let Some(policy) = &self.config.checkpoint {
            if policy.interval > 0 && step % policy.interval == 0 {
                match self.write_checkpoint(policy) {
                    Ok(path) => info!(step, path = %path.display(), "checkpoint written"),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(step, error = %e, "checkpoint failed, training continues"),
                }
            }
        }
        if self.config.log_interval > 0 && step % self.config.log_interval == 0 {
            info!(snapshot = %self.snapshot(), "training progress");
        }
        Ok(())
    }

    fn write_checkpoint(&self, policy: &CheckpointPolicy) -> Result<PathBuf> {
        let path = policy.path_for(self.learner.name(), self.steps);
        self.learner.save_model(&path)?;
        *self.last_checkpoint.lock() = Some(path.clone());
        Ok(path)
    }

    /// Writes a checkpoint immediately into the configured directory.
    pub fn checkpoint_now(&self) -> Result<PathBuf> {
        let policy = self.config.checkpoint.as_ref().ok_or_else(|| {
            RLError::InvalidConfig("no checkpoint directory configured".into())
        })?;
        self.write_checkpoint(policy)
    }

    /// Restores the learner from `path`.
    pub fn load_checkpoint(&self, path: &Path) -> Result<()> {
        self.learner.load_model(path)?;
        info!(path = %path.display(), "checkpoint loaded");
        Ok(())
    }

    fn report(&self, stop_reason: StopReason, elapsed: Duration, run_steps: u64) -> TrainingReport {
        let t = &self.totals;
        let episodes = t.episodes as f64;
        let secs = elapsed.as_secs_f64();
        TrainingReport {
            stop_reason,
            steps: self.steps,
            transitions: t.transitions,
            skipped: t.skipped,
            episodes: t.episodes,
            success_rate: if t.episodes == 0 { 0.0 } else { t.successes as f64 / episodes },
            mean_episode_reward: (t.episodes > 0).then(|| t.episode_reward / episodes),
            mean_episode_length: (t.episodes > 0).then(|| t.episode_steps as f64 / episodes),
            elapsed,
            steps_per_sec: if secs > 0.0 { run_steps as f64 / secs } else { 0.0 },
            last_checkpoint: self.last_checkpoint(),
        }
    }
}

/// Steps every agent of one environment. Returns the tick aggregate and
/// the error that should halt training, if any.
fn step_worker<A, L, E>(worker: &mut Worker<E>, learner: &L) -> (TickSummary, Option<RLError>)
where
    A: Action,
    L: Learner<A> + ?Sized,
    E: Environment<A>,
{
    let mut summary = TickSummary::default();
    for local in 0..worker.returns.len() {
        let agent = worker.first_agent + local;
        match step_agent::<A, L, E>(worker, local, agent, learner) {
            Ok(end) => {
                summary.transitions += 1;
                if let Some(end) = end {
                    summary.episodes += 1;
                    summary.successes += u64::from(end.success);
                    summary.episode_reward += end.reward;
                    summary.episode_steps += end.steps;
                    debug!(agent, reward = end.reward, steps = end.steps, "episode finished");
                }
            }
            Err(e) if e.is_fatal() || e == RLError::Shutdown => return (summary, Some(e)),
            Err(e) => {
                warn!(agent, error = %e, "skipping agent step");
                summary.skipped += 1;
            }
        }
    }
    (summary, None)
}

fn step_agent<A, L, E>(
    worker: &mut Worker<E>,
    local: AgentId,
    agent: AgentId,
    learner: &L,
) -> Result<Option<EpisodeEnd>>
where
    A: Action,
    L: Learner<A> + ?Sized,
    E: Environment<A>,
{
    if worker.env.episode_done(local) {
        reset::<A, E>(worker, local)?;
    }
    let state = worker.env.capture_state(local)?;
    let action = learner.select_action(&state)?;
    let reward = worker.env.apply_action(local, action)?;
    let next_state = worker.env.capture_state(local)?;
    let done = worker.env.episode_done(local);
    worker.returns[local] += reward;
    worker.lengths[local] += 1;

    learner.ingest(agent, Experience::new(state, action, reward, next_state, done)?)?;
    if !done {
        return Ok(None);
    }
    let end = EpisodeEnd {
        reward: worker.returns[local],
        steps: worker.lengths[local],
        success: worker.env.episode_succeeded(local),
    };
    reset::<A, E>(worker, local)?;
    Ok(Some(end))
}

fn reset<A: Action, E: Environment<A>>(worker: &mut Worker<E>, local: AgentId) -> Result<()> {
    worker.env.reset_agent(local)?;
    worker.returns[local] = 0.0;
    worker.lengths[local] = 0;
    Ok(())
}

impl<A, L: ?Sized, E> fmt::Debug for TrainingOrchestrator<A, L, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingOrchestrator")
            .field("state", &self.state)
            .field("steps", &self.steps)
            .field("environments", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::agent::QAgent;
    use crate::algorithms::rl::config::RLConfig;
    use crate::algorithms::rl::environment::{CorridorAction, CorridorEnvironment};
    use crate::algorithms::rl::metrics::LearnerStats;
    use crate::algorithms::rl::observation::StateVector;
    use crate::algorithms::rl::policy::Policy;

    fn agent() -> Arc<QAgent<CorridorAction>> {
        let config = RLConfig {
            learning_rate: 0.5,
            exploration_rate: 0.2,
            seed: Some(9),
            ..RLConfig::default()
        };
        Arc::new(QAgent::new(5, config).unwrap())
    }

    fn corridors(n: usize, agents: usize) -> Vec<CorridorEnvironment> {
        (0..n)
            .map(|_| CorridorEnvironment::new(5, agents, 30).unwrap())
            .collect()
    }

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("ludorl-orch-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn run_honors_step_limit() {
        let config = OrchestratorConfig {
            worker_threads: Some(2),
            ..OrchestratorConfig::default()
        };
        let mut orch = TrainingOrchestrator::new(agent(), corridors(2, 2), config).unwrap();
        assert_eq!(orch.num_agents(), 4);
        let report = orch.run(Some(50)).unwrap();
        assert_eq!(report.stop_reason, StopReason::StepLimit);
        assert_eq!(report.steps, 50);
        assert_eq!(report.transitions + report.skipped, 200);
        assert!(report.episodes > 0);
        assert_eq!(orch.state(), OrchestratorState::Stopped);
        assert_eq!(orch.monitor().steps(), 50);
    }

    #[test]
    fn stop_handle_ends_run() {
        let mut orch =
            TrainingOrchestrator::new(agent(), corridors(1, 1), OrchestratorConfig::default())
                .unwrap();
        let handle = orch.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.stop();
            handle.stop();
        });
        let report = orch.run(None).unwrap();
        stopper.join().unwrap();
        assert_eq!(report.stop_reason, StopReason::Requested);
        assert!(report.steps > 0);
    }

    #[test]
    fn stop_before_run_is_honored_once() {
        let mut orch =
            TrainingOrchestrator::new(agent(), corridors(1, 1), OrchestratorConfig::default())
                .unwrap();
        orch.stop_training();
        let report = orch.run(None).unwrap();
        assert_eq!(report.stop_reason, StopReason::Requested);
        assert_eq!(report.steps, 0);

        let report = orch.run(Some(5)).unwrap();
        assert_eq!(report.stop_reason, StopReason::StepLimit);
        assert_eq!(report.steps, 5);
    }

    #[test]
    fn checkpoints_on_interval() {
        let dir = scratch();
        let config = OrchestratorConfig {
            checkpoint: Some(CheckpointPolicy::new(10, &dir)),
            ..OrchestratorConfig::default()
        };
        let mut orch = TrainingOrchestrator::new(agent(), corridors(1, 1), config).unwrap();
        let report = orch.run(Some(25)).unwrap();
        let policy = CheckpointPolicy::new(10, &dir);
        assert!(policy.path_for("q-learning", 10).exists());
        assert!(policy.path_for("q-learning", 20).exists());
        assert_eq!(report.last_checkpoint, Some(policy.path_for("q-learning", 20)));

        let fresh = agent();
        let restored =
            TrainingOrchestrator::new(Arc::clone(&fresh), corridors(1, 1), OrchestratorConfig::default())
                .unwrap();
        restored.load_checkpoint(&policy.path_for("q-learning", 20)).unwrap();
        assert!(!fresh.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_checkpoint_does_not_stop_training() {
        let dir = scratch();
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let config = OrchestratorConfig {
            checkpoint: Some(CheckpointPolicy::new(5, blocker.join("ckpt"))),
            ..OrchestratorConfig::default()
        };
        let mut orch = TrainingOrchestrator::new(agent(), corridors(1, 1), config).unwrap();
        let report = orch.run(Some(20)).unwrap();
        assert_eq!(report.steps, 20);
        assert_eq!(report.last_checkpoint, None);
        assert!(orch.checkpoint_now().is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn exploration_schedule_anneals_learner() {
        let schedule = ExplorationSchedule {
            start: 1.0,
            end: 0.1,
            decay_steps: 10,
        };
        assert_eq!(schedule.rate_at(0), 1.0);
        assert!((schedule.rate_at(5) - 0.55).abs() < 1e-12);
        assert_eq!(schedule.rate_at(50), 0.1);

        let learner = agent();
        let config = OrchestratorConfig {
            exploration: Some(schedule),
            ..OrchestratorConfig::default()
        };
        let mut orch = TrainingOrchestrator::new(Arc::clone(&learner), corridors(1, 1), config).unwrap();
        orch.run(Some(12)).unwrap();
        assert_eq!(learner.exploration_rate(), 0.1);
    }

    struct Corrupted;

    impl Policy<CorridorAction> for Corrupted {
        fn select_action(&self, _state: &StateVector) -> Result<CorridorAction> {
            Ok(CorridorAction::Right)
        }

        fn name(&self) -> &str {
            "corrupted"
        }
    }

    impl Learner<CorridorAction> for Corrupted {
        fn ingest(&self, _agent: AgentId, _experience: Experience<CorridorAction>) -> Result<()> {
            Ok(())
        }

        fn exploration_rate(&self) -> f64 {
            0.0
        }

        fn set_exploration_rate(&self, _rate: f64) -> Result<()> {
            Ok(())
        }

        fn save_model(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn load_model(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn stats(&self) -> LearnerStats {
            LearnerStats::new("corrupted", 0, 0.0)
        }

        fn verify(&self) -> Result<()> {
            Err(RLError::ConcurrencyViolation("root sum mismatch".into()))
        }
    }

    #[test]
    fn failed_verification_halts() {
        let config = OrchestratorConfig {
            verify_interval: 5,
            ..OrchestratorConfig::default()
        };
        let mut orch =
            TrainingOrchestrator::new(Arc::new(Corrupted), corridors(1, 1), config).unwrap();
        let err = orch.run(Some(100)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(orch.steps(), 5);
        assert_eq!(orch.state(), OrchestratorState::Stopped);
    }

    #[test]
    fn dyn_learner_is_accepted() {
        let learner: Arc<dyn Learner<CorridorAction>> = agent();
        let mut orch =
            TrainingOrchestrator::new(learner, corridors(1, 2), OrchestratorConfig::default())
                .unwrap();
        orch.step().unwrap();
        assert_eq!(orch.snapshot().step, 1);
    }

    #[test]
    fn rejects_empty_environment_list() {
        let envs: Vec<CorridorEnvironment> = Vec::new();
        assert!(TrainingOrchestrator::new(agent(), envs, OrchestratorConfig::default()).is_err());
    }
}
