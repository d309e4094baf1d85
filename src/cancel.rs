//! Coarse cancellation shared between the stage engine, transfers and the
//! timer/signal threads that trip it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{FerryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Wall-clock budget ran out (`upload --timeout`)
    Timeout,
    /// Ctrl-C
    Interrupted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => write!(f, "timeout reached"),
            CancelReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// First reason wins; later calls only keep the flag set.
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    /// Bail out with `FerryError::Cancelled` if the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FerryError::Cancelled(
                self.reason().unwrap_or(CancelReason::Interrupted),
            ))
        } else {
            Ok(())
        }
    }

    /// Trip the token with `CancelReason::Timeout` once `after` has elapsed.
    /// The timer thread is detached; it exits early if the token is tripped
    /// for another reason.
    pub fn arm_timeout(&self, after: Duration) {
        let token = self.clone();
        let deadline = Instant::now() + after;
        thread::spawn(move || {
            while !token.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!("timeout of {}s reached, stopping", after.as_secs());
                    token.cancel(CancelReason::Timeout);
                    break;
                }
                thread::sleep((deadline - now).min(Duration::from_millis(200)));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel(CancelReason::Timeout);
        token.cancel(CancelReason::Interrupted);
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
        assert!(matches!(
            token.check(),
            Err(FerryError::Cancelled(CancelReason::Timeout))
        ));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel(CancelReason::Interrupted);
        assert!(token.is_cancelled());
    }

    #[test]
    fn timeout_trips_token() {
        let token = CancelToken::new();
        token.arm_timeout(Duration::from_millis(20));
        let start = Instant::now();
        while !token.is_cancelled() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }
}
