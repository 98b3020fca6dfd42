//! Fixed-interval completion polling with cooperative cancellation.

use super::{CancelToken, CommandStatus};
use crate::error::AppResult;
use std::thread;
use std::time::Duration;

/// How a polled job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Exited(i32),
    Canceled,
}

impl PollOutcome {
    pub fn status(self) -> CommandStatus {
        match self {
            PollOutcome::Exited(0) => CommandStatus::Success,
            PollOutcome::Exited(_) => CommandStatus::Failed,
            PollOutcome::Canceled => CommandStatus::Canceled,
        }
    }
}

/// Call `check` every `interval` until it reports an exit code or `token`
/// is canceled. `check` returns `None` while the job is still running.
///
/// The token is checked once per interval, so cancellation is observed
/// within one interval. There is no overall timeout.
pub fn poll<F>(interval: Duration, token: &CancelToken, mut check: F) -> AppResult<PollOutcome>
where
    F: FnMut() -> AppResult<Option<i32>>,
{
    loop {
        if token.is_canceled() {
            return Ok(PollOutcome::Canceled);
        }
        if let Some(code) = check()? {
            return Ok(PollOutcome::Exited(code));
        }
        thread::sleep(interval);
    }
}
