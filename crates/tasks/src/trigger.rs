//! Triggers decide when a job fires, independent of what fires.
//!
//! An armed trigger is a spawned sleep task that sends one fire notification
//! on the owning worker's dispatch channel, then goes back to stopped. The
//! owner restarts it once the fire has been handled.

use std::time::Duration;

use {
    chrono::{Datelike, Local, TimeZone, Timelike},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::debug,
};

use crate::{
    error::{Error, Result},
    types::{DAY_MS, DayOfWeek, ExecutionResult, TriggerDescriptor, TriggerKind, now_ms},
};

/// Floor applied to a stale interval deadline so a trigger armed long after
/// its last run does not fire at time zero.
const INTERVAL_FLOOR_MS: u64 = 60_000;

/// Delay for a startup catch-up fire of a missed Daily/Weekly occurrence.
const CATCHUP_DELAY_MS: u64 = 5_000;

/// A fire notification sent to the owning worker's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriggerFired {
    /// Index into the worker's descriptor set.
    pub index: usize,
    /// Arm generation; fires from a disposed generation are inert.
    pub generation: u64,
}

/// Milliseconds since local midnight, and the local weekday, at `now`.
fn local_clock(now: u64) -> (u64, chrono::Weekday) {
    let dt = Local
        .timestamp_millis_opt(now as i64)
        .earliest()
        .unwrap_or_else(Local::now);
    let since_midnight =
        u64::from(dt.num_seconds_from_midnight()) * 1000 + u64::from(dt.timestamp_subsec_millis());
    (since_midnight, dt.weekday())
}

/// Compute the next fire instant (epoch millis) for a descriptor.
///
/// `last` is the most recent execution record, used for interval anchoring
/// and for the startup catch-up decision. Startup triggers always return
/// `now`; the once-per-lifetime bookkeeping lives in [`RuntimeTrigger`].
pub fn next_fire_at_ms(
    descriptor: &TriggerDescriptor,
    last: Option<&ExecutionResult>,
    is_startup: bool,
    now: u64,
) -> Result<u64> {
    match descriptor.kind {
        TriggerKind::Daily => {
            let tod = descriptor
                .time_of_day_ms
                .ok_or_else(|| Error::invalid_configuration("daily trigger requires timeOfDayMs"))?;
            Ok(next_occurrence(tod, None, last, is_startup, now))
        },
        TriggerKind::Weekly => {
            let tod = descriptor.time_of_day_ms.ok_or_else(|| {
                Error::invalid_configuration("weekly trigger requires timeOfDayMs")
            })?;
            let dow = descriptor
                .day_of_week
                .ok_or_else(|| Error::invalid_configuration("weekly trigger requires dayOfWeek"))?;
            Ok(next_occurrence(tod, Some(dow), last, is_startup, now))
        },
        TriggerKind::Interval => {
            let interval = descriptor.interval_ms.ok_or_else(|| {
                Error::invalid_configuration("interval trigger requires intervalMs")
            })?;
            if interval == 0 {
                return Err(Error::invalid_configuration("intervalMs must be > 0"));
            }
            Ok(match last {
                // First run ever: one full interval out, never immediately.
                None => now + interval,
                Some(result) => {
                    let natural = result.finished_at_ms + interval;
                    if natural > now {
                        natural
                    } else {
                        now + INTERVAL_FLOOR_MS
                    }
                },
            })
        },
        TriggerKind::Startup => Ok(now),
    }
}

/// Next wall-clock occurrence of `time_of_day_ms` (restricted to a weekday
/// for weekly triggers), strictly in the future.
///
/// At application startup, an occurrence the process slept through fires
/// once after [`CATCHUP_DELAY_MS`] instead of waiting a full period.
fn next_occurrence(
    time_of_day_ms: u64,
    day_of_week: Option<DayOfWeek>,
    last: Option<&ExecutionResult>,
    is_startup: bool,
    now: u64,
) -> u64 {
    let (since_midnight, weekday_now) = local_clock(now);
    let midnight = now - since_midnight;
    let period = if day_of_week.is_some() {
        7 * DAY_MS
    } else {
        DAY_MS
    };

    let mut candidate = match day_of_week {
        None => midnight + time_of_day_ms,
        Some(dow) => {
            let days_ahead = u64::from(
                (dow.to_chrono().num_days_from_monday() + 7 - weekday_now.num_days_from_monday())
                    % 7,
            );
            midnight + days_ahead * DAY_MS + time_of_day_ms
        },
    };
    if candidate <= now {
        candidate += period;
    }

    // The most recent scheduled occurrence; at or before `now` by construction.
    let previous = candidate - period;
    if is_startup
        && let Some(result) = last
        && result.finished_at_ms < previous
    {
        return now + CATCHUP_DELAY_MS;
    }

    candidate
}

/// Live counterpart of a [`TriggerDescriptor`]: an armed timer plus the
/// bookkeeping needed to stop and re-arm it.
pub(crate) struct RuntimeTrigger {
    descriptor: TriggerDescriptor,
    index: usize,
    timer: Option<JoinHandle<()>>,
    /// Startup triggers fire once per trigger lifetime.
    startup_fired: bool,
}

impl RuntimeTrigger {
    pub fn new(descriptor: TriggerDescriptor, index: usize) -> Self {
        Self {
            descriptor,
            index,
            timer: None,
            startup_fired: false,
        }
    }

    pub fn descriptor(&self) -> &TriggerDescriptor {
        &self.descriptor
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Arm the timer; sends one [`TriggerFired`] on `fire_tx` when it elapses.
    ///
    /// A no-op for a startup trigger that has already fired.
    pub fn start(
        &mut self,
        last: Option<&ExecutionResult>,
        is_startup: bool,
        generation: u64,
        fire_tx: mpsc::Sender<TriggerFired>,
    ) -> Result<()> {
        self.stop();

        if self.descriptor.kind == TriggerKind::Startup {
            if self.startup_fired {
                return Ok(());
            }
            self.startup_fired = true;
        }

        let fire_at = next_fire_at_ms(&self.descriptor, last, is_startup, now_ms())?;
        let delay = fire_at.saturating_sub(now_ms());
        debug!(
            kind = ?self.descriptor.kind,
            index = self.index,
            delay_ms = delay,
            "trigger armed"
        );

        let index = self.index;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = fire_tx.send(TriggerFired { index, generation }).await;
        }));
        Ok(())
    }

    /// Disarm the timer. Idempotent; safe to call when not armed.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for RuntimeTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}
