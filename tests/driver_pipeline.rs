//! Lockstep stages exchanging Buffers through managed channels

mod common;

use common::builders::sample_layout;
use corrflow::{
    buffer::FieldHandle,
    channel::ChannelTag,
    concurrency::{Direction, IoMode},
    driver::{SchedulerState, Stage, StageContext, StageDriver, StageOutcome},
    transport::LoopbackTransport,
    ConcurrencyManager, Result,
};
use crossbeam_channel::{unbounded, Sender};

struct Producer {
    output: ChannelTag,
    samples: FieldHandle,
}

impl Stage for Producer {
    fn name(&self) -> &str {
        "producer"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let mut entry = ctx.channels.get_write_locked_buffer(self.output)?;
        if let Some(buffer) = entry.buffer_mut() {
            buffer.set(self.samples, 0, ctx.cycle as i16)?;
        }
        ctx.channels.release(self.output, entry)?;
        Ok(StageOutcome::Continue)
    }
}

struct Consumer {
    input: ChannelTag,
    samples: FieldHandle,
    seen: Sender<i16>,
    stop_after: Option<u64>,
}

impl Stage for Consumer {
    fn name(&self) -> &str {
        "consumer"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let entry = ctx.channels.get_read_locked_buffer(self.input)?;
        let value = entry.buffer().get::<i16>(self.samples, 0);
        ctx.channels.release(self.input, entry)?;
        let _ = self.seen.send(value?);
        if self.stop_after == Some(ctx.cycle) {
            ctx.state.stop();
        }
        Ok(StageOutcome::Continue)
    }
}

fn pipeline(mode: IoMode, stop_after: Option<u64>) -> (StageDriver, crossbeam_channel::Receiver<i16>) {
    let state = SchedulerState::new();
    let mut channels = ConcurrencyManager::new(state.tags());
    let (layout, samples) = sample_layout();
    let (tx, rx) = LoopbackTransport::pair();
    let output = channels
        .open(layout.clone_layout(), layout.clone_layout(), tx.into(), Direction::Output, mode)
        .unwrap();
    let input = channels
        .open(layout.clone_layout(), layout.clone_layout(), rx.into(), Direction::Input, mode)
        .unwrap();

    let (seen_tx, seen_rx) = unbounded();
    let mut driver = StageDriver::new(state, channels);
    driver.add_stage(Box::new(Producer { output, samples }));
    driver.add_stage(Box::new(Consumer {
        input,
        samples,
        seen: seen_tx,
        stop_after,
    }));
    (driver, seen_rx)
}

#[test]
fn test_synchronous_pipeline() {
    let (driver, seen) = pipeline(IoMode::Synchronous, None);
    let mut driver = driver.with_max_cycles(12);
    let report = driver.run().unwrap();
    assert_eq!(report.cycles, 12);
    assert_eq!(report.alarms, 0);
    assert_eq!(seen.try_iter().collect::<Vec<_>>(), (0..12).collect::<Vec<_>>());
}

#[test]
fn test_asynchronous_pipeline() {
    let (driver, seen) = pipeline(IoMode::Asynchronous { pool_size: 2 }, None);
    let mut driver = driver.with_max_cycles(25);
    let report = driver.run().unwrap();
    assert_eq!(report.cycles, 25);
    assert_eq!(seen.try_iter().collect::<Vec<_>>(), (0..25).collect::<Vec<_>>());
    assert_eq!(driver.state().active_stages(), 0);
}

#[test]
fn test_stage_can_stop_the_driver() {
    let (driver, seen) = pipeline(IoMode::Synchronous, Some(3));
    let mut driver = driver.with_max_cycles(100);
    let report = driver.run().unwrap();
    assert_eq!(report.cycles, 4);
    assert_eq!(seen.try_iter().count(), 4);
    assert!(!driver.state().is_running());
}

#[test]
fn test_channel_tags_come_from_scheduler_state() {
    let (mut driver, _) = pipeline(IoMode::Synchronous, None);
    let tags = driver.channels().channel_tags();
    assert_eq!(tags, vec![ChannelTag(0), ChannelTag(1)]);
    assert_eq!(driver.state().tags().issued(), 2);
}
