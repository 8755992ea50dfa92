use std::{cell::Cell, rc::Rc};

use tracing::trace;

use crate::engine::{NativeHandle, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Armed,
    Fired,
    Cancelled,
}

/// A one-shot callback scheduled with [`Hub::schedule_call_global`](super::Hub::schedule_call_global).
///
/// Dropping a `Timer` does not cancel it.
#[derive(Debug)]
pub struct Timer {
    handle: TimerHandle,
    state: Rc<Cell<TimerState>>,
}

impl Timer {
    pub(crate) fn new(handle: TimerHandle, state: Rc<Cell<TimerState>>) -> Self {
        Self { handle, state }
    }

    pub fn state(&self) -> TimerState {
        self.state.get()
    }

    /// Stops and closes the timer if it is still open. No-op after it fired or
    /// was cancelled.
    pub fn cancel(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(err) = self.handle.stop() {
            trace!(%err, "timer stop failed during cancel");
        }
        self.handle.close();
        self.state.set(TimerState::Cancelled);
    }
}
