//! Error taxonomy. `ClockError` covers the misuse classes that must fail
//! immediately at the call site; `ClockException` is what `run` returns
//! when a fired Action raised.

use crate::time::Time;

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("cannot schedule at t={requested}: clock is already at t={now}")]
    ScheduleMisuse { now: Time, requested: Time },

    #[error("{what} is only callable from inside a running process (clock {clock_id})")]
    ProcessMisuse { what: &'static str, clock_id: u64 },

    #[error("handle belongs to a different clock")]
    ForeignClock,

    #[error("clock's inbox is closed, it has already shut down")]
    Closed,
}

pub type ClockResult<T> = Result<T, ClockError>;

/// Raised from `run` when a fired Action returns an error. Virtual time is
/// left at the instant of the failing action; the schedule is not rolled
/// back.
#[derive(Debug, thiserror::Error)]
#[error("action failed at t={t}: {source}")]
pub struct ClockException {
    pub t: Time,
    #[source]
    pub source: anyhow::Error,
}

impl ClockException {
    pub fn new(t: Time, source: anyhow::Error) -> Self {
        Self { t, source }
    }
}
