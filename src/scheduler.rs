use thiserror::Error;

use crate::host::Tick;

pub type IntervalCallback<C, H> = Box<dyn FnMut(&mut C, &mut H, Tick) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalHandle(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("interval for '{0}' must be at least one tick")]
    ZeroInterval(String),
}

struct Interval<C, H: ?Sized> {
    handle: IntervalHandle,
    label: String,
    every: Option<Tick>,
    next_due: Tick,
    callback: IntervalCallback<C, H>,
}

/// Tick counter plus interval callbacks, run in registration order on every [`Scheduler::advance`].
pub struct Scheduler<C, H: ?Sized> {
    tick: Tick,
    next_handle: u64,
    intervals: Vec<Interval<C, H>>,
}

impl<C, H: ?Sized> Default for Scheduler<C, H> {
    fn default() -> Self {
        Self { tick: 0, next_handle: 0, intervals: Vec::new() }
    }
}

impl<C, H: ?Sized> Scheduler<C, H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// First runs `interval` ticks from now, then every `interval` ticks until cancelled.
    pub fn run_every<F>(
        &mut self,
        interval: Tick,
        label: impl Into<String>,
        callback: F,
    ) -> Result<IntervalHandle, SchedulerError>
    where
        F: FnMut(&mut C, &mut H, Tick) -> anyhow::Result<()> + 'static,
    {
        self.register(interval, Some(interval), label.into(), Box::new(callback))
    }

    /// Runs once, `delay` ticks from now.
    pub fn run_after<F>(&mut self, delay: Tick, label: impl Into<String>, callback: F) -> Result<IntervalHandle, SchedulerError>
    where
        F: FnMut(&mut C, &mut H, Tick) -> anyhow::Result<()> + 'static,
    {
        self.register(delay, None, label.into(), Box::new(callback))
    }

    fn register(
        &mut self,
        delay: Tick,
        every: Option<Tick>,
        label: String,
        callback: IntervalCallback<C, H>,
    ) -> Result<IntervalHandle, SchedulerError> {
        if delay == 0 {
            return Err(SchedulerError::ZeroInterval(label));
        }
        self.next_handle += 1;
        let handle = IntervalHandle(self.next_handle);
        self.intervals.push(Interval { handle, label, every, next_due: self.tick + delay, callback });
        Ok(handle)
    }

    pub fn cancel(&mut self, handle: IntervalHandle) -> bool {
        let before = self.intervals.len();
        self.intervals.retain(|interval| interval.handle != handle);
        self.intervals.len() != before
    }

    pub fn is_scheduled(&self, handle: IntervalHandle) -> bool {
        self.intervals.iter().any(|interval| interval.handle == handle)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.intervals.iter().map(|interval| interval.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Moves to the next tick and runs every callback due on it. Returns the new tick.
    pub fn advance(&mut self, ctx: &mut C, host: &mut H) -> Tick {
        self.tick += 1;
        let now = self.tick;
        let mut finished = false;
        for interval in self.intervals.iter_mut().filter(|interval| interval.next_due == now) {
            if let Err(err) = (interval.callback)(ctx, host, now) {
                log::warn!("[scheduler] '{}' failed at tick {now}: {err:?}", interval.label);
            }
            match interval.every {
                Some(every) => interval.next_due = now + every,
                None => finished = true,
            }
        }
        if finished {
            self.intervals.retain(|interval| interval.every.is_some() || interval.next_due > now);
        }
        now
    }
}
