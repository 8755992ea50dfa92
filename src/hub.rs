//! The per-thread reactor.
//!
//! A [`Hub`] owns the native [`Loop`], the set of live fd [`Listener`]s and the
//! queue of callbacks scheduled to run at the start of the next loop iteration.
//! Every OS thread gets its own hub on first use, reachable through
//! [`Hub::current`] / [`get_hub`].

mod listener;
mod timer;
mod trampoline;

pub use listener::{EventKind, Listener, ListenerId};
pub use timer::{Timer, TimerState};
pub use trampoline::{Readiness, wait};

pub(crate) use trampoline::Wakeup;

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    future::Future,
    mem,
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use tracing::{debug, error, warn};

use crate::{
    engine::{
        DEFAULT_EVENTS_CAPACITY, IdleHandle, Loop, NativeHandle, PollHandle, PrepareHandle,
        Ready, RunMode, Signal, SignalHandle, TimerHandle,
    },
    error::{EngineError, HubError},
    executor::Executor,
    spawner::{JoinError, JoinHandle},
};

static NEXT_HUB_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Rc<Hub>>> = const { RefCell::new(None) };
    static REGISTRY: RefCell<HashMap<usize, Weak<Hub>>> = RefCell::new(HashMap::new());
}

type Callback = Box<dyn FnOnce()>;

/// Settings a hub is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Maximum number of readiness events collected by one poll.
    pub events_capacity: usize,
    /// Watch SIGINT and turn it into [`HubError::Interrupted`].
    ///
    /// A SIGINT reaches every hub in the process that watches it, so one
    /// Ctrl-C interrupts all of them. Turn this off on worker threads that
    /// should keep running.
    pub catch_interrupt: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            catch_interrupt: true,
        }
    }
}

/// Returns the calling thread's hub, creating it on first use.
///
/// # Panics
///
/// Panics if the thread has no hub yet and the native event loop cannot be created.
pub fn get_hub() -> Rc<Hub> {
    Hub::current()
}

pub struct Hub {
    id: usize,
    engine: Loop,
    listeners: RefCell<HashMap<ListenerId, Listener>>,
    next_listener: Cell<usize>,
    callbacks: RefCell<Vec<Callback>>,
    running: Cell<bool>,
    stopping: Cell<bool>,
    interrupted: Cell<bool>,
    drains: Cell<u64>,
    prepare: PrepareHandle,
    idle: IdleHandle,
    interrupt: Option<SignalHandle>,
    pub(crate) executor: Executor,
}

/// Resets the run flags however `run` is left.
struct RunGuard<'a>(&'a Hub);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.set(false);
        self.0.stopping.set(false);
    }
}

impl Hub {
    /// The calling thread's hub, created with [`HubConfig::default`] on first use.
    ///
    /// # Panics
    ///
    /// Panics if the native event loop cannot be created.
    pub fn current() -> Rc<Self> {
        match Self::try_current() {
            Ok(hub) => hub,
            Err(err) => panic!("failed to create the thread's hub: {err}"),
        }
    }

    /// Like [`Hub::current`], but reports a failure to create the hub.
    pub fn try_current() -> Result<Rc<Self>, HubError> {
        if let Some(hub) = CURRENT.with_borrow(|current| current.clone()) {
            return Ok(hub);
        }
        let hub = Self::new(&HubConfig::default())?;
        CURRENT.set(Some(Rc::clone(&hub)));
        Ok(hub)
    }

    /// Replaces the thread's hub with one built from `config`.
    pub fn install(config: &HubConfig) -> Result<Rc<Self>, HubError> {
        let running = CURRENT.with_borrow(|current| {
            current.as_ref().is_some_and(|hub| hub.is_running())
        });
        if running {
            return Err(HubError::AlreadyRunning);
        }
        let hub = Self::new(config)?;
        let previous = CURRENT.replace(Some(Rc::clone(&hub)));
        drop(previous);
        Ok(hub)
    }

    /// Builds a hub without making it the thread's current one.
    pub fn new(config: &HubConfig) -> Result<Rc<Self>, HubError> {
        let engine = Loop::with_capacity(config.events_capacity)?;
        let prepare = PrepareHandle::new(&engine);
        let idle = IdleHandle::new(&engine);
        let interrupt = config.catch_interrupt.then(|| SignalHandle::new(&engine));
        let executor = Executor::new(&engine)?;

        let hub = Rc::new(Self {
            id: NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            listeners: RefCell::new(HashMap::new()),
            next_listener: Cell::new(0),
            callbacks: RefCell::new(Vec::new()),
            running: Cell::new(false),
            stopping: Cell::new(false),
            interrupted: Cell::new(false),
            drains: Cell::new(0),
            prepare,
            idle,
            interrupt,
            executor,
        });

        let weak = Rc::downgrade(&hub);
        hub.prepare.start(move |_| {
            if let Some(hub) = weak.upgrade() {
                hub.fire_callbacks();
            }
        })?;
        hub.prepare.set_ref(false)?;
        hub.arm_interrupt()?;
        hub.executor.start(Rc::downgrade(&hub))?;

        REGISTRY.with_borrow_mut(|registry| registry.insert(hub.id, Rc::downgrade(&hub)));
        debug!(hub = hub.id, catch_interrupt = config.catch_interrupt, "hub created");
        Ok(hub)
    }

    /// Looks up a hub living on the calling thread by id.
    pub(crate) fn lookup(id: usize) -> Option<Rc<Self>> {
        REGISTRY
            .try_with(|registry| registry.borrow().get(&id).and_then(Weak::upgrade))
            .ok()
            .flatten()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn engine(&self) -> &Loop {
        &self.engine
    }

    /// Watches `fd` for `kind` and calls `callback` every loop iteration the fd
    /// is ready.
    ///
    /// A panic in `callback` is logged and swallowed; the listener is then
    /// removed and `on_error` runs once.
    pub fn add<F, E>(
        self: &Rc<Self>,
        kind: EventKind,
        fd: RawFd,
        callback: F,
        on_error: E,
    ) -> Result<Listener, HubError>
    where
        F: FnMut() + 'static,
        E: FnOnce() + 'static,
    {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        let listener = Listener::new(id, kind, fd, PollHandle::new(&self.engine, fd));

        let weak_hub = Rc::downgrade(self);
        let weak_listener = listener.downgrade();
        let mut callback = callback;
        let mut on_error = Some(on_error);
        let poll_cb = move |_: &PollHandle, _: Ready| {
            let Err(panic) = panic::catch_unwind(AssertUnwindSafe(&mut callback)) else {
                return;
            };
            squelch(panic, "listener callback");
            if let (Some(hub), Some(listener)) = (weak_hub.upgrade(), weak_listener.upgrade()) {
                if let Err(err) = hub.remove(&listener) {
                    warn!(fd = listener.fd(), %err, "failed to remove listener after callback panic");
                }
            }
            if let Some(on_error) = on_error.take() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(on_error)) {
                    squelch(panic, "listener error callback");
                }
            }
        };

        let started = match listener.handle().borrow().as_ref() {
            Some(handle) => handle.start(kind.interest(), poll_cb),
            None => Err(EngineError::HandleClosed),
        };
        if let Err(err) = started {
            let mut slot = listener.handle().borrow_mut();
            if let Some(handle) = slot.take() {
                handle.close();
            }
            return Err(err.into());
        }

        self.listeners
            .borrow_mut()
            .insert(id, listener.clone());
        Ok(listener)
    }

    /// Tears a listener down: unref, stop and close its poll handle, then drop it.
    ///
    /// Removing a listener twice returns [`HubError::ListenerRemoved`].
    pub fn remove(&self, listener: &Listener) -> Result<(), HubError> {
        let registered = self.listeners.borrow_mut().remove(&listener.id());
        let released = release(&mut *listener.handle().borrow_mut());
        drop(registered);
        released
    }

    /// Queues `cb` to run at the start of the next loop iteration.
    pub fn schedule_call_now<F>(&self, cb: F)
    where
        F: FnOnce() + 'static,
    {
        let was_empty = {
            let mut callbacks = self.callbacks.borrow_mut();
            let was_empty = callbacks.is_empty();
            callbacks.push(Box::new(cb));
            was_empty
        };
        if was_empty {
            if let Err(err) = self.prepare.set_ref(true) {
                warn!(%err, "failed to reference the prepare handle");
            }
        }
    }

    /// Runs `cb` once after `delay`. A zero delay means the next iteration.
    pub fn schedule_call_global<F>(&self, delay: Duration, cb: F) -> Result<Timer, HubError>
    where
        F: FnOnce() + 'static,
    {
        let handle = TimerHandle::new(&self.engine)?;
        let state = Rc::new(Cell::new(TimerState::Armed));
        let fired = Rc::clone(&state);
        let mut cb = Some(cb);
        let started = handle.start(delay, move |timer| {
            fired.set(TimerState::Fired);
            if let Some(cb) = cb.take() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(cb)) {
                    squelch(panic, "timer callback");
                }
            }
            if !timer.is_closed() {
                if let Err(err) = timer.stop() {
                    warn!(%err, "failed to stop fired timer");
                }
                timer.close();
            }
        });
        if let Err(err) = started {
            handle.close();
            return Err(err.into());
        }
        Ok(Timer::new(handle, state))
    }

    /// Drives the loop until nothing keeps it alive or [`Hub::abort`] is called.
    pub fn run(&self) -> Result<(), HubError> {
        if self.stopping.get() {
            return Ok(());
        }
        if self.running.get() {
            return Err(HubError::AlreadyRunning);
        }

        debug!(hub = self.id, "start runloop");
        self.running.set(true);
        self.stopping.set(false);
        let _guard = RunGuard(self);
        self.engine.run(RunMode::Default)?;
        Ok(())
    }

    /// Makes the current (or next) [`Hub::run`] return.
    pub fn abort(&self) {
        debug!(hub = self.id, "abort loop");
        if self.running.get() {
            self.stopping.set(true);
        }
        self.engine.stop();
    }

    /// Spawns `future` as a fiber. It is first polled on the next loop iteration.
    pub fn spawn<F>(self: &Rc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (task, state) = crate::spawner::bind(future);
        let id = self.executor.insert(task);
        self.executor.schedule(self, id);
        JoinHandle::new(id, state, Rc::downgrade(self))
    }

    /// Spawns `future` as a detached fiber.
    pub fn spawn_n<F>(self: &Rc<Self>, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.executor.insert(crate::executor::TaskFuture::detached(future));
        self.executor.schedule(self, id);
    }

    /// Spawns `future` and polls it right away, before returning to the caller.
    pub fn spawn_now<F>(self: &Rc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (task, state) = crate::spawner::bind(future);
        let id = self.executor.insert(task);
        let handle = JoinHandle::new(id, state, Rc::downgrade(self));
        self.executor.poll(self, id);
        handle
    }

    /// Runs the loop until `future` completes.
    ///
    /// The future runs as the hub's root fiber. If the loop returns first, the
    /// root fiber is cancelled and the reason is reported: an interrupt, an
    /// [`abort`](Hub::abort), or nothing left that could ever wake it.
    pub fn block_on<F>(self: &Rc<Self>, future: F) -> Result<F::Output, HubError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.arm_interrupt()?;
        self.interrupted.set(false);

        let root = self.spawn(future);
        let weak = Rc::downgrade(self);
        root.on_complete(move || {
            if let Some(hub) = weak.upgrade() {
                hub.abort();
            }
        });

        let ran = self.run();
        if let Some(result) = root.try_take() {
            return result.map_err(|err| match err {
                JoinError::Panicked => HubError::Panicked,
                JoinError::Cancelled => HubError::Aborted,
            });
        }
        root.abort();
        ran?;

        if self.interrupted.replace(false) {
            Err(HubError::Interrupted)
        } else if self.engine.is_alive() {
            Err(HubError::Aborted)
        } else {
            Err(HubError::Deadlock)
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn pending_count(&self) -> usize {
        self.callbacks.borrow().len()
    }

    /// Number of completed callback drains, one per loop iteration.
    pub fn drain_count(&self) -> u64 {
        self.drains.get()
    }

    /// Number of live fibers.
    pub fn task_count(&self) -> usize {
        self.executor.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    fn fire_callbacks(&self) {
        self.drains.set(self.drains.get() + 1);
        let batch = mem::take(&mut *self.callbacks.borrow_mut());
        for cb in batch {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(cb)) {
                squelch(panic, "scheduled callback");
            }
        }

        // Work queued by this batch waits for the next iteration; idle makes
        // that iteration's poll return immediately.
        let pending = !self.callbacks.borrow().is_empty();
        if pending {
            if let Err(err) = self.idle.start(|idle| {
                if let Err(err) = idle.stop() {
                    warn!(%err, "failed to stop the idle handle");
                }
            }) {
                warn!(%err, "failed to start the idle handle");
            }
        }
        if let Err(err) = self.prepare.set_ref(pending) {
            warn!(%err, "failed to update the prepare handle");
        }
    }

    fn arm_interrupt(self: &Rc<Self>) -> Result<(), HubError> {
        let Some(interrupt) = &self.interrupt else {
            return Ok(());
        };
        if interrupt.is_active() {
            return Ok(());
        }
        let weak = Rc::downgrade(self);
        interrupt.start(Signal::SIGINT, move |handle, signum| {
            if let Some(hub) = weak.upgrade() {
                hub.signal_received(handle, signum);
            }
        })?;
        interrupt.set_ref(false)?;
        Ok(())
    }

    fn signal_received(&self, handle: &SignalHandle, signum: Signal) {
        if signum != Signal::SIGINT {
            return;
        }
        debug!(hub = self.id, "interrupt received");
        if let Err(err) = handle.stop() {
            warn!(%err, "failed to stop the interrupt watcher");
        }
        self.interrupted.set(true);
        self.abort();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        let _ = REGISTRY.try_with(|registry| registry.borrow_mut().remove(&self.id));
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("id", &self.id)
            .field("running", &self.running.get())
            .field("stopping", &self.stopping.get())
            .field("listeners", &self.listener_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Unref, stop, close, then forget a native handle.
///
/// The slot is emptied even when one of the steps fails; the first failure is
/// returned. An empty slot means the handle was already released.
pub(crate) fn release<H: NativeHandle>(slot: &mut Option<H>) -> Result<(), HubError> {
    let Some(handle) = slot.as_ref() else {
        return Err(HubError::ListenerRemoved);
    };
    let unref = handle.set_ref(false);
    let stop = handle.stop();
    handle.close();
    *slot = None;
    unref.and(stop).map_err(HubError::from)
}

/// Logs a panic caught at a callback boundary and drops it.
pub(crate) fn squelch(panic: Box<dyn Any + Send>, origin: &str) {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    error!(origin, panic = message, "squelched panic");
}
