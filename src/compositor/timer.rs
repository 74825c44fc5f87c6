use std::{
    os::fd::{AsFd as _, AsRawFd as _, RawFd},
    time,
};

use nix::sys::{
    time::TimeSpec,
    timerfd::{ClockId, Expiration, TimerFd as RawTimerFd, TimerFlags, TimerSetTimeFlags},
};

use crate::compositor::output::OutputKey;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The output reaches its next vsync boundary.
    OutputVsync(OutputKey),
}

/// The main loop's single timerfd.
pub struct TimerFd(RawTimerFd);

impl TimerFd {
    pub fn new() -> anyhow::Result<Self> {
        let fd = RawTimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;

        Ok(Self(fd))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }

    fn set_timeout(&mut self, delay: time::Duration) -> anyhow::Result<()> {
        self.0.set(
            Expiration::OneShot(TimeSpec::from_duration(delay)),
            TimerSetTimeFlags::empty(),
        )?;

        Ok(())
    }

    /// Drains the expiration counter after a poll wakeup.
    pub fn read(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 8];
        loop {
            match nix::unistd::read(self.as_raw_fd(), &mut buf) {
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Multiplexes timed callbacks over the single timerfd. The timerfd is
/// only rearmed when the earliest deadline decreases.
#[derive(Default)]
pub struct Timers {
    deadlines: Vec<(time::Instant, TimerEvent)>,
}

impl Timers {
    pub fn schedule(
        &mut self,
        timer: &mut TimerFd,
        at: time::Instant,
        event: TimerEvent,
    ) -> anyhow::Result<()> {
        let earliest = self.deadlines.iter().map(|(when, _)| *when).min();

        self.deadlines.push((at, event));

        if earliest.map_or(true, |earliest| at < earliest) {
            let delay = at
                .saturating_duration_since(time::Instant::now())
                .max(time::Duration::from_micros(1));
            timer.set_timeout(delay)?;
        }

        Ok(())
    }

    /// Pops every deadline at or before `now` and rearms the timerfd for
    /// the next one.
    pub fn fire(
        &mut self,
        timer: &mut TimerFd,
        now: time::Instant,
    ) -> anyhow::Result<Vec<TimerEvent>> {
        let mut due = Vec::new();
        self.deadlines.retain(|(when, event)| {
            if *when <= now {
                due.push(*event);
                false
            } else {
                true
            }
        });

        if let Some(earliest) = self.deadlines.iter().map(|(when, _)| *when).min() {
            let delay = earliest
                .saturating_duration_since(now)
                .max(time::Duration::from_micros(1));
            timer.set_timeout(delay)?;
        }

        Ok(due)
    }
}
