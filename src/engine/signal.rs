//! Signal delivery through `signal-hook`.
//!
//! Every watcher owns its own `signal-hook-mio` self-pipe, so any number of
//! loops may watch the same signal and each one of them sees every delivery.
//! While nobody watches a signal it keeps its default disposition: the
//! process-wide handler `signal-hook` leaves installed falls back to the
//! default action.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use mio::Token;
use nix::sys::signal::Signal;
use signal_hook::flag;
use signal_hook_mio::v1_0::Signals;

use crate::error::EngineError;

/// Per-signal watcher count, and the flag that turns the default action back
/// on once the count drops to zero.
struct Fallback {
    signum: Signal,
    watchers: usize,
    unwatched: Arc<AtomicBool>,
}

static FALLBACKS: Mutex<Vec<Fallback>> = Mutex::new(Vec::new());

/// Counts one watcher of `signum` for as long as it lives.
struct Watching(Signal);

impl Watching {
    fn start(signum: Signal) -> Result<Self, EngineError> {
        let mut fallbacks = FALLBACKS.lock().unwrap_or_else(PoisonError::into_inner);
        let index = match fallbacks.iter().position(|f| f.signum == signum) {
            Some(index) => index,
            None => {
                let unwatched = Arc::new(AtomicBool::new(false));
                flag::register_conditional_default(signum as i32, Arc::clone(&unwatched))?;
                fallbacks.push(Fallback {
                    signum,
                    watchers: 0,
                    unwatched,
                });
                fallbacks.len() - 1
            }
        };
        let fallback = &mut fallbacks[index];
        fallback.watchers += 1;
        fallback.unwatched.store(false, Ordering::Release);
        Ok(Self(signum))
    }
}

impl Drop for Watching {
    fn drop(&mut self) {
        let mut fallbacks = FALLBACKS.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fallback) = fallbacks.iter_mut().find(|f| f.signum == self.0) {
            fallback.watchers = fallback.watchers.saturating_sub(1);
            if fallback.watchers == 0 {
                fallback.unwatched.store(true, Ordering::Release);
            }
        }
    }
}

/// An armed watcher: the `signal-hook` pipe the loop polls.
pub(crate) struct SignalWatch {
    signals: Signals,
    signum: Signal,
    token: Token,
    _watching: Watching,
}

impl SignalWatch {
    pub(crate) fn open(signum: Signal, token: Token) -> Result<Self, EngineError> {
        let watching = Watching::start(signum)?;
        let signals = Signals::new([signum as i32])?;
        Ok(Self {
            signals,
            signum,
            token,
            _watching: watching,
        })
    }

    pub(crate) fn source_mut(&mut self) -> &mut Signals {
        &mut self.signals
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn signum(&self) -> Signal {
        self.signum
    }

    /// Empties the pipe. Returns whether the watched signal had been delivered.
    pub(crate) fn drain(&mut self) -> bool {
        let signum = self.signum as i32;
        let mut delivered = false;
        for pending in self.signals.pending() {
            delivered |= pending == signum;
        }
        delivered
    }
}
