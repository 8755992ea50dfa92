use std::{
    cell::RefCell,
    fmt,
    os::fd::RawFd,
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use mio::{Interest, event::Event};

use super::{HandleId, Kind, Loop, LoopCore, Signal, upgrade};
use crate::error::EngineError;

/// Operations every native handle supports.
///
/// The hub tears handles down through this trait, which is also what lets the
/// teardown order be observed with a recording double in tests.
pub trait NativeHandle {
    /// A referenced, active handle keeps [`Loop::run`] from returning.
    fn set_ref(&self, referenced: bool) -> Result<(), EngineError>;
    /// Deactivates the handle without releasing it.
    fn stop(&self) -> Result<(), EngineError>;
    /// Releases the handle. Closing an already closed handle does nothing.
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn is_active(&self) -> bool;
}

/// What an fd was reported ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Ready {
    pub(crate) fn from_event(event: &Event) -> Self {
        // Hang-ups and errors wake both directions so the waiter sees the failure.
        let error = event.is_error();
        Self {
            readable: event.is_readable() || event.is_read_closed() || error,
            writable: event.is_writable() || event.is_write_closed() || error,
            error,
        }
    }
}

/// Weak back-reference plus table key shared by every handle type.
struct RawHandle {
    core: Weak<LoopCore>,
    id: HandleId,
}

impl RawHandle {
    fn new(lp: &Loop, kind: Kind) -> Self {
        let core = lp.core();
        Self {
            id: core.insert(kind),
            core: Rc::downgrade(core),
        }
    }

    fn core(&self) -> Result<Rc<LoopCore>, EngineError> {
        upgrade(&self.core)
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.id)
    }
}

macro_rules! native_handle {
    ($name:ident) => {
        impl $name {
            pub(crate) fn view(core: Weak<LoopCore>, id: HandleId) -> Self {
                Self {
                    raw: RawHandle { core, id },
                }
            }

            /// Whether this handle currently keeps the loop alive when active.
            pub fn has_ref(&self) -> bool {
                self.raw
                    .core()
                    .map(|core| core.has_ref(self.raw.id))
                    .unwrap_or(false)
            }
        }

        impl NativeHandle for $name {
            fn set_ref(&self, referenced: bool) -> Result<(), EngineError> {
                self.raw.core()?.set_ref(self.raw.id, referenced)
            }

            fn stop(&self) -> Result<(), EngineError> {
                self.raw.core()?.stop(self.raw.id)
            }

            fn close(&self) {
                if let Ok(core) = self.raw.core() {
                    core.close(self.raw.id);
                }
            }

            fn is_closed(&self) -> bool {
                self.raw
                    .core()
                    .map(|core| core.is_closed(self.raw.id))
                    .unwrap_or(true)
            }

            fn is_active(&self) -> bool {
                self.raw
                    .core()
                    .map(|core| core.is_active(self.raw.id))
                    .unwrap_or(false)
            }
        }
    };
}

/// Watches one fd for readability and/or writability.
#[derive(Debug)]
pub struct PollHandle {
    raw: RawHandle,
}

impl PollHandle {
    /// The fd is borrowed, not owned; it must outlive the handle's active period.
    pub fn new(lp: &Loop, fd: RawFd) -> Self {
        Self {
            raw: RawHandle::new(
                lp,
                Kind::Poll {
                    fd,
                    interest: None,
                    cb: None,
                },
            ),
        }
    }

    /// Starts (or restarts with a new interest) polling the fd.
    pub fn start<F>(&self, interest: Interest, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&PollHandle, Ready) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&PollHandle, Ready)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.poll_start(self.raw.id, interest, cb)
    }
}

native_handle!(PollHandle);

/// One-shot timer backed by a `timerfd`.
#[derive(Debug)]
pub struct TimerHandle {
    raw: RawHandle,
}

impl TimerHandle {
    pub fn new(lp: &Loop) -> Result<Self, EngineError> {
        let core = lp.core();
        let id = core.new_timer()?;
        Ok(Self::view(Rc::downgrade(core), id))
    }

    /// Arms the timer. A zero delay fires on the next loop iteration.
    pub fn start<F>(&self, delay: Duration, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&TimerHandle) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&TimerHandle)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.timer_start(self.raw.id, delay, cb)
    }
}

native_handle!(TimerHandle);

/// Runs its callback at the start of every loop iteration.
#[derive(Debug)]
pub struct PrepareHandle {
    raw: RawHandle,
}

impl PrepareHandle {
    pub fn new(lp: &Loop) -> Self {
        Self {
            raw: RawHandle::new(lp, Kind::Prepare { cb: None }),
        }
    }

    pub fn start<F>(&self, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&PrepareHandle) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&PrepareHandle)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.prepare_start(self.raw.id, cb)
    }
}

native_handle!(PrepareHandle);

/// While active, forces the loop to poll with a zero timeout.
#[derive(Debug)]
pub struct IdleHandle {
    raw: RawHandle,
}

impl IdleHandle {
    pub fn new(lp: &Loop) -> Self {
        Self {
            raw: RawHandle::new(lp, Kind::Idle { cb: None }),
        }
    }

    /// Starting an already active idle handle only swaps its callback.
    pub fn start<F>(&self, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&IdleHandle) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&IdleHandle)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.idle_start(self.raw.id, cb)
    }
}

native_handle!(IdleHandle);

/// Wakes the loop from any thread. At most one per loop.
#[derive(Debug)]
pub struct AsyncHandle {
    raw: RawHandle,
}

impl AsyncHandle {
    pub fn new(lp: &Loop) -> Result<Self, EngineError> {
        if lp.core().has_async() {
            return Err(EngineError::AsyncInUse);
        }
        Ok(Self {
            raw: RawHandle::new(lp, Kind::Async { cb: None }),
        })
    }

    pub fn start<F>(&self, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&AsyncHandle) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&AsyncHandle)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.async_start(self.raw.id, cb)
    }

    /// A thread-safe trigger for this handle's callback.
    pub fn sender(&self) -> Result<AsyncSender, EngineError> {
        let waker = self.raw.core()?.async_waker()?;
        Ok(AsyncSender { waker })
    }
}

native_handle!(AsyncHandle);

/// Sending half of an [`AsyncHandle`]. Wake-ups sent before the loop polls
/// again are coalesced into one callback.
#[derive(Debug, Clone)]
pub struct AsyncSender {
    waker: Arc<mio::Waker>,
}

impl AsyncSender {
    pub fn send(&self) -> Result<(), EngineError> {
        self.waker.wake().map_err(EngineError::from)
    }
}

/// Delivers one OS signal to the loop thread.
#[derive(Debug)]
pub struct SignalHandle {
    raw: RawHandle,
}

impl SignalHandle {
    pub fn new(lp: &Loop) -> Self {
        Self {
            raw: RawHandle::new(
                lp,
                Kind::Signal {
                    watch: None,
                    cb: None,
                },
            ),
        }
    }

    /// Installs the process-wide handler for `signum` if needed and starts
    /// routing deliveries to `cb`.
    pub fn start<F>(&self, signum: Signal, cb: F) -> Result<(), EngineError>
    where
        F: FnMut(&SignalHandle, Signal) + 'static,
    {
        let cb: Rc<RefCell<dyn FnMut(&SignalHandle, Signal)>> = Rc::new(RefCell::new(cb));
        self.raw.core()?.signal_start(self.raw.id, signum, cb)
    }
}

native_handle!(SignalHandle);
