//! Lockstep stage driver.
//!
//! The driver owns the node's pipeline thread. Each cycle:
//! 1. Call `process` on every stage in registration order.
//! 2. Bump the shared cycle counter.
//! 3. Rate-limit to the configured cycle period.
//!
//! `preprocess` runs once for every stage before the first cycle and
//! `postprocess` once after the last, also when a stage fails. Only stages
//! whose `preprocess` succeeded get a `postprocess`.
//!
//! # Scheduler state
//!
//! Everything that would otherwise be process-wide mutable state (running
//! flag, number of active stages, alarm count, cycle counter, channel tag
//! allocator) lives in one [`SchedulerState`], created when the pipeline is
//! built and handed to every stage through its [`StageContext`].

use crate::channel::TagAllocator;
use crate::concurrency::ConcurrencyManager;
use crate::error::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state of one pipeline instance.
#[derive(Debug)]
pub struct SchedulerState {
    running: AtomicBool,
    active_stages: AtomicUsize,
    alarms: AtomicU64,
    cycle: AtomicU64,
    tags: Arc<TagAllocator>,
}

impl SchedulerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            active_stages: AtomicUsize::new(0),
            alarms: AtomicU64::new(0),
            cycle: AtomicU64::new(0),
            tags: Arc::new(TagAllocator::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the driver to stop after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn active_stages(&self) -> usize {
        self.active_stages.load(Ordering::SeqCst)
    }

    /// Record a recoverable problem (a skipped cycle, a failed channel).
    pub fn raise_alarm(&self) -> u64 {
        self.alarms.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alarms(&self) -> u64 {
        self.alarms.load(Ordering::SeqCst)
    }

    /// Cycles completed so far.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Allocator for channel tags of this pipeline.
    pub fn tags(&self) -> Arc<TagAllocator> {
        self.tags.clone()
    }
}

/// What a stage gets for each call.
pub struct StageContext<'a> {
    pub state: &'a SchedulerState,
    pub channels: &'a mut ConcurrencyManager,
    /// Cycle being processed (0-based)
    pub cycle: u64,
}

/// Result of one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Keep going
    Continue,
    /// This stage has no more work; the driver stops after this cycle
    Finished,
}

/// One processing step of the pipeline.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn preprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome>;

    fn postprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub cycles: u64,
    pub alarms: u64,
    pub elapsed_ms: u128,
}

/// Runs stages in lockstep.
pub struct StageDriver {
    stages: Vec<Box<dyn Stage>>,
    state: Arc<SchedulerState>,
    channels: ConcurrencyManager,
    cycle_period: Option<Duration>,
    max_cycles: Option<u64>,
    last_cycle_time: Option<Instant>,
}

impl StageDriver {
    pub fn new(state: Arc<SchedulerState>, channels: ConcurrencyManager) -> Self {
        Self {
            stages: Vec::new(),
            state,
            channels,
            cycle_period: None,
            max_cycles: None,
            last_cycle_time: None,
        }
    }

    /// Pace cycles to at most one per `period`.
    pub fn with_cycle_period(mut self, period: Duration) -> Self {
        self.cycle_period = (!period.is_zero()).then_some(period);
        self
    }

    /// Stop after `cycles` cycles.
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub fn channels(&mut self) -> &mut ConcurrencyManager {
        &mut self.channels
    }

    fn for_each_stage(
        &mut self,
        cycle: u64,
        mut call: impl FnMut(&mut dyn Stage, &mut StageContext<'_>) -> Result<()>,
    ) -> Result<()> {
        for stage in self.stages.iter_mut() {
            let mut ctx = StageContext {
                state: &self.state,
                channels: &mut self.channels,
                cycle,
            };
            call(stage.as_mut(), &mut ctx)?;
        }
        Ok(())
    }

    /// Run until a stage finishes, the cycle limit is reached, or
    /// [`SchedulerState::stop`] is called.
    ///
    /// A fatal stage error ends the run and is returned; a non-fatal one
    /// raises an alarm and the cycle continues with the next stage.
    pub fn run(&mut self) -> Result<DriverReport> {
        let run_started = Instant::now();
        tracing::info!("Stage driver starting {} stage(s)", self.stages.len());

        let state = self.state.clone();
        let mut started = 0;
        let pre = self.for_each_stage(0, |stage, ctx| {
            tracing::debug!("Preprocessing stage {}", stage.name());
            stage.preprocess(ctx)?;
            state.active_stages.fetch_add(1, Ordering::SeqCst);
            started += 1;
            Ok(())
        });

        let result = match pre {
            Ok(()) => self.run_cycles(),
            Err(e) => {
                tracing::error!(
                    "Preprocessing failed after {} of {} stage(s): {}",
                    started,
                    self.stages.len(),
                    e
                );
                Err(e)
            }
        };

        let post = self.postprocess(started);
        if let Err(e) = self.channels.shutdown() {
            tracing::warn!("Channel shutdown reported: {}", e);
        }
        result?;
        post?;

        let report = DriverReport {
            cycles: self.state.cycle(),
            alarms: self.state.alarms(),
            elapsed_ms: run_started.elapsed().as_millis(),
        };
        tracing::info!(
            "Stage driver finished: {} cycles, {} alarms in {} ms",
            report.cycles,
            report.alarms,
            report.elapsed_ms
        );
        Ok(report)
    }

    /// Postprocess the first `started` stages, all of them even if one fails.
    /// Returns the first error.
    fn postprocess(&mut self, started: usize) -> Result<()> {
        let cycle = self.state.cycle();
        let mut first_error = None;
        for stage in self.stages.iter_mut().take(started) {
            let mut ctx = StageContext {
                state: &self.state,
                channels: &mut self.channels,
                cycle,
            };
            tracing::debug!("Postprocessing stage {}", stage.name());
            if let Err(e) = stage.postprocess(&mut ctx) {
                tracing::warn!("Stage {} postprocess failed: {}", stage.name(), e);
                first_error.get_or_insert(e);
            }
            self.state.active_stages.fetch_sub(1, Ordering::SeqCst);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn run_cycles(&mut self) -> Result<()> {
        while self.state.is_running() {
            if self.max_cycles.is_some_and(|max| self.state.cycle() >= max) {
                break;
            }
            let cycle = self.state.cycle();
            let mut finished = false;
            let state = self.state.clone();
            self.for_each_stage(cycle, |stage, ctx| match stage.process(ctx) {
                Ok(StageOutcome::Continue) => Ok(()),
                Ok(StageOutcome::Finished) => {
                    tracing::info!("Stage {} finished at cycle {}", stage.name(), cycle);
                    finished = true;
                    Ok(())
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Stage {} failed at cycle {}: {}", stage.name(), cycle, e);
                    Err(e.with_context(format!("stage {} cycle {}", stage.name(), cycle)))
                }
                Err(e) => {
                    let alarms = state.raise_alarm();
                    tracing::warn!(
                        "Stage {} cycle {}: {} (alarm {})",
                        stage.name(),
                        cycle,
                        e,
                        alarms
                    );
                    Ok(())
                }
            })?;
            self.state.cycle.fetch_add(1, Ordering::SeqCst);
            self.rate_limit();
            self.last_cycle_time = Some(Instant::now());
            if finished {
                break;
            }
        }
        Ok(())
    }

    fn rate_limit(&self) {
        let (Some(period), Some(last)) = (self.cycle_period, self.last_cycle_time) else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < period {
            let remaining = period - elapsed;
            // Sleep for the bulk, spin for the last millisecond
            if remaining > Duration::from_millis(2) {
                std::thread::sleep(remaining - Duration::from_millis(1));
            }
            while last.elapsed() < period {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    struct Counter {
        name: String,
        processed: u64,
        fail_every: Option<u64>,
        finish_at: Option<u64>,
    }

    impl Counter {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                processed: 0,
                fail_every: None,
                finish_at: None,
            }
        }
    }

    impl Stage for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
            assert_eq!(ctx.cycle, self.processed);
            self.processed += 1;
            if self.fail_every.is_some_and(|n| self.processed % n == 0) {
                return Err(RuntimeError::transport("dropped input"));
            }
            if self.finish_at == Some(self.processed) {
                return Ok(StageOutcome::Finished);
            }
            Ok(StageOutcome::Continue)
        }
    }

    fn driver() -> StageDriver {
        let state = SchedulerState::new();
        let channels = ConcurrencyManager::new(state.tags());
        StageDriver::new(state, channels)
    }

    #[test]
    fn test_runs_requested_cycles() {
        let mut driver = driver().with_max_cycles(5);
        driver.add_stage(Box::new(Counter::new("a")));
        driver.add_stage(Box::new(Counter::new("b")));
        let report = driver.run().unwrap();
        assert_eq!(report.cycles, 5);
        assert_eq!(report.alarms, 0);
        assert_eq!(driver.state().active_stages(), 0);
    }

    #[test]
    fn test_non_fatal_errors_raise_alarms() {
        let mut driver = driver().with_max_cycles(6);
        let mut stage = Counter::new("lossy");
        stage.fail_every = Some(3);
        driver.add_stage(Box::new(stage));
        let report = driver.run().unwrap();
        assert_eq!(report.cycles, 6);
        assert_eq!(report.alarms, 2);
    }

    #[test]
    fn test_finished_stage_stops_driver() {
        let mut driver = driver().with_max_cycles(100);
        let mut stage = Counter::new("short");
        stage.finish_at = Some(4);
        driver.add_stage(Box::new(stage));
        assert_eq!(driver.run().unwrap().cycles, 4);
    }

    #[test]
    fn test_fatal_error_ends_run() {
        struct Broken;
        impl Stage for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn process(&mut self, _ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
                Err(RuntimeError::HandshakeMismatch("wired wrong".to_string()))
            }
        }
        let mut driver = driver().with_max_cycles(10);
        driver.add_stage(Box::new(Broken));
        let err = driver.run().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(driver.state().cycle(), 0);
    }

    /// Records its lifecycle calls; optionally fails one of them.
    struct Lifecycle {
        name: &'static str,
        fail_preprocess: bool,
        fail_postprocess: bool,
        postprocessed: Arc<AtomicUsize>,
    }

    impl Lifecycle {
        fn new(name: &'static str, postprocessed: &Arc<AtomicUsize>) -> Self {
            Self {
                name,
                fail_preprocess: false,
                fail_postprocess: false,
                postprocessed: postprocessed.clone(),
            }
        }
    }

    impl Stage for Lifecycle {
        fn name(&self) -> &str {
            self.name
        }

        fn preprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
            if self.fail_preprocess {
                return Err(RuntimeError::Config("no antenna field".to_string()));
            }
            Ok(())
        }

        fn process(&mut self, _ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
            Ok(StageOutcome::Continue)
        }

        fn postprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
            self.postprocessed.fetch_add(1, Ordering::SeqCst);
            if self.fail_postprocess {
                return Err(RuntimeError::transport("summary sink gone"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_preprocess_unwinds_started_stages() {
        let postprocessed = Arc::new(AtomicUsize::new(0));
        let mut driver = driver().with_max_cycles(10);
        driver.add_stage(Box::new(Lifecycle::new("first", &postprocessed)));
        let mut broken = Lifecycle::new("second", &postprocessed);
        broken.fail_preprocess = true;
        driver.add_stage(Box::new(broken));
        driver.add_stage(Box::new(Lifecycle::new("third", &postprocessed)));

        assert!(matches!(driver.run(), Err(RuntimeError::Config(_))));
        assert_eq!(postprocessed.load(Ordering::SeqCst), 1);
        assert_eq!(driver.state().active_stages(), 0);
        assert_eq!(driver.state().cycle(), 0);
    }

    #[test]
    fn test_failed_postprocess_still_runs_the_rest() {
        let postprocessed = Arc::new(AtomicUsize::new(0));
        let mut driver = driver().with_max_cycles(2);
        let mut failing = Lifecycle::new("first", &postprocessed);
        failing.fail_postprocess = true;
        driver.add_stage(Box::new(failing));
        driver.add_stage(Box::new(Lifecycle::new("second", &postprocessed)));

        assert!(driver.run().is_err());
        assert_eq!(postprocessed.load(Ordering::SeqCst), 2);
        assert_eq!(driver.state().active_stages(), 0);
    }

    #[test]
    fn test_cycle_period_paces() {
        let mut driver = driver()
            .with_max_cycles(3)
            .with_cycle_period(Duration::from_millis(5));
        driver.add_stage(Box::new(Counter::new("paced")));
        let report = driver.run().unwrap();
        assert!(report.elapsed_ms >= 10);
    }
}
