//! A libuv-flavoured event loop driven by `mio::Poll`.
//!
//! The loop owns a table of handles: fd pollers, one-shot timers, prepare and
//! idle hooks, a cross-thread async wake-up and signal watchers. Handle objects
//! only keep a weak reference back to the loop, so the loop alone decides when
//! native resources go away.
//!
//! `run` keeps iterating for as long as at least one handle is both *active*
//! and *referenced*. An iteration is:
//!
//! 1. idle callbacks,
//! 2. prepare callbacks,
//! 3. I/O poll (zero timeout when an idle handle is active, a stop is pending
//!    or nothing keeps the loop alive; otherwise block),
//! 4. dispatch of fd readiness, timer expiry, async wake-ups and signals.

mod handle;
mod signal;

pub use handle::{
    AsyncHandle, AsyncSender, IdleHandle, NativeHandle, PollHandle, PrepareHandle, Ready,
    SignalHandle, TimerHandle,
};
pub use nix::sys::signal::Signal;

use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::{BTreeMap, HashMap},
    io,
    os::fd::{AsFd, AsRawFd, RawFd},
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use mio::{Events, Interest, Token, unix::SourceFd};
use nix::sys::{
    time::TimeSpec,
    timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags},
};
use tracing::trace;

use crate::error::EngineError;

/// Reserved for the loop's `mio::Waker`.
const ASYNC_TOKEN: Token = Token(0);

/// Events buffer size used by [`Loop::new`].
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// How far a single call to [`Loop::run`] goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until nothing keeps the loop alive or [`Loop::stop`] is called.
    Default,
    /// One iteration, blocking for I/O if the loop is alive.
    Once,
    /// One iteration, never blocking.
    NoWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct HandleId(usize);

type PollCb = Rc<RefCell<dyn FnMut(&PollHandle, Ready)>>;
type TimerCb = Rc<RefCell<dyn FnMut(&TimerHandle)>>;
type PrepareCb = Rc<RefCell<dyn FnMut(&PrepareHandle)>>;
type IdleCb = Rc<RefCell<dyn FnMut(&IdleHandle)>>;
type AsyncCb = Rc<RefCell<dyn FnMut(&AsyncHandle)>>;
type SignalCb = Rc<RefCell<dyn FnMut(&SignalHandle, Signal)>>;

pub(crate) enum Kind {
    Poll {
        fd: RawFd,
        interest: Option<Interest>,
        cb: Option<PollCb>,
    },
    Timer {
        timer: TimerFd,
        token: Token,
        cb: Option<TimerCb>,
    },
    Prepare {
        cb: Option<PrepareCb>,
    },
    Idle {
        cb: Option<IdleCb>,
    },
    Async {
        cb: Option<AsyncCb>,
    },
    Signal {
        watch: Option<signal::SignalWatch>,
        cb: Option<SignalCb>,
    },
}

pub(crate) struct Entry {
    kind: Kind,
    active: bool,
    referenced: bool,
}

/// One OS registration shared by every poll handle watching the same fd.
#[derive(Debug)]
struct FdWatch {
    token: Token,
    readable: Option<HandleId>,
    writable: Option<HandleId>,
}

impl FdWatch {
    fn interest(&self) -> Option<Interest> {
        match (self.readable.is_some(), self.writable.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Fd(RawFd),
    Timer(HandleId),
    Signal(HandleId),
}

/// The native event loop. Exclusively owned by whoever created it; handles
/// refer back to it weakly.
pub struct Loop {
    core: Rc<LoopCore>,
}

impl Loop {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    /// Creates a loop whose poll call returns at most `events_capacity` events.
    pub fn with_capacity(events_capacity: usize) -> Result<Self, EngineError> {
        let poll = mio::Poll::new()?;
        Ok(Self {
            core: Rc::new(LoopCore {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(events_capacity.max(1))),
                entries: RefCell::new(BTreeMap::new()),
                watches: RefCell::new(HashMap::new()),
                targets: RefCell::new(HashMap::new()),
                async_waker: OnceCell::new(),
                next_id: Cell::new(0),
                next_token: Cell::new(1),
                stop_flag: Cell::new(false),
                running: Cell::new(false),
            }),
        })
    }

    /// Runs the loop. Returns whether the loop is still alive afterwards.
    pub fn run(&self, mode: RunMode) -> Result<bool, EngineError> {
        self.core.run(mode)
    }

    /// Makes the current (or next) `run` return after its iteration.
    pub fn stop(&self) {
        self.core.stop_flag.set(true);
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.get()
    }

    /// Number of open handles, active or not.
    pub fn handle_count(&self) -> usize {
        self.core.entries.borrow().len()
    }

    pub(crate) fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }
}

pub(crate) struct LoopCore {
    poll: RefCell<mio::Poll>,
    events: RefCell<Events>,
    entries: RefCell<BTreeMap<HandleId, Entry>>,
    watches: RefCell<HashMap<RawFd, FdWatch>>,
    targets: RefCell<HashMap<Token, Target>>,
    async_waker: OnceCell<Arc<mio::Waker>>,
    next_id: Cell<usize>,
    next_token: Cell<usize>,
    stop_flag: Cell<bool>,
    running: Cell<bool>,
}

/// Clears a flag when dropped, whichever way the scope is left.
struct ClearOnDrop<'a>(&'a Cell<bool>);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl LoopCore {
    pub(crate) fn insert(&self, kind: Kind) -> HandleId {
        let id = HandleId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().insert(
            id,
            Entry {
                kind,
                active: false,
                referenced: true,
            },
        );
        id
    }

    fn allocate_token(&self) -> Token {
        let token = Token(self.next_token.get());
        self.next_token.set(token.0 + 1);
        token
    }

    fn with_entry<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Result<R, EngineError> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(&id).ok_or(EngineError::HandleClosed)?;
        Ok(f(entry))
    }

    pub(crate) fn set_ref(&self, id: HandleId, referenced: bool) -> Result<(), EngineError> {
        self.with_entry(id, |entry| entry.referenced = referenced)
    }

    pub(crate) fn has_ref(&self, id: HandleId) -> bool {
        self.with_entry(id, |entry| entry.referenced)
            .unwrap_or(false)
    }

    pub(crate) fn is_active(&self, id: HandleId) -> bool {
        self.with_entry(id, |entry| entry.active).unwrap_or(false)
    }

    pub(crate) fn is_closed(&self, id: HandleId) -> bool {
        !self.entries.borrow().contains_key(&id)
    }

    fn is_alive(&self) -> bool {
        self.entries
            .borrow()
            .values()
            .any(|entry| entry.active && entry.referenced)
    }

    fn idle_pending(&self) -> bool {
        self.entries
            .borrow()
            .values()
            .any(|entry| entry.active && matches!(entry.kind, Kind::Idle { .. }))
    }

    pub(crate) fn new_timer(&self) -> Result<HandleId, EngineError> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        let token = self.allocate_token();
        let fd = timer.as_fd().as_raw_fd();
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        let id = self.insert(Kind::Timer {
            timer,
            token,
            cb: None,
        });
        self.targets.borrow_mut().insert(token, Target::Timer(id));
        Ok(id)
    }

    pub(crate) fn async_waker(&self) -> Result<Arc<mio::Waker>, EngineError> {
        if let Some(waker) = self.async_waker.get() {
            return Ok(Arc::clone(waker));
        }
        let waker = Arc::new(mio::Waker::new(self.poll.borrow().registry(), ASYNC_TOKEN)?);
        Ok(Arc::clone(self.async_waker.get_or_init(|| waker)))
    }

    pub(crate) fn has_async(&self) -> bool {
        self.entries
            .borrow()
            .values()
            .any(|entry| matches!(entry.kind, Kind::Async { .. }))
    }

    pub(crate) fn poll_start(
        &self,
        id: HandleId,
        interest: Interest,
        cb: PollCb,
    ) -> Result<(), EngineError> {
        let (fd, previous) = self.with_entry(id, |entry| match &entry.kind {
            Kind::Poll { fd, interest, .. } => Ok((*fd, *interest)),
            _ => Err(EngineError::HandleClosed),
        })??;
        if previous.is_some() {
            self.detach(id, fd);
        }
        self.attach(id, fd, interest)?;
        self.with_entry(id, |entry| {
            entry.active = true;
            if let Kind::Poll {
                interest: slot,
                cb: cb_slot,
                ..
            } = &mut entry.kind
            {
                *slot = Some(interest);
                *cb_slot = Some(cb);
            }
        })
    }

    pub(crate) fn timer_start(
        &self,
        id: HandleId,
        delay: Duration,
        cb: TimerCb,
    ) -> Result<(), EngineError> {
        // An all-zero expiration disarms a timerfd.
        let delay = delay.max(Duration::from_nanos(1));
        self.with_entry(id, |entry| match &mut entry.kind {
            Kind::Timer { timer, cb: slot, .. } => {
                timer.set(
                    Expiration::OneShot(TimeSpec::from_duration(delay)),
                    TimerSetTimeFlags::empty(),
                )?;
                *slot = Some(cb);
                entry.active = true;
                Ok(())
            }
            _ => Err(EngineError::HandleClosed),
        })?
    }

    pub(crate) fn prepare_start(&self, id: HandleId, cb: PrepareCb) -> Result<(), EngineError> {
        self.with_entry(id, |entry| {
            if let Kind::Prepare { cb: slot } = &mut entry.kind {
                *slot = Some(cb);
                entry.active = true;
            }
        })
    }

    pub(crate) fn idle_start(&self, id: HandleId, cb: IdleCb) -> Result<(), EngineError> {
        self.with_entry(id, |entry| {
            if let Kind::Idle { cb: slot } = &mut entry.kind {
                *slot = Some(cb);
                entry.active = true;
            }
        })
    }

    pub(crate) fn async_start(&self, id: HandleId, cb: AsyncCb) -> Result<(), EngineError> {
        self.async_waker()?;
        self.with_entry(id, |entry| {
            if let Kind::Async { cb: slot } = &mut entry.kind {
                *slot = Some(cb);
                entry.active = true;
            }
        })
    }

    pub(crate) fn signal_start(
        &self,
        id: HandleId,
        signum: Signal,
        cb: SignalCb,
    ) -> Result<(), EngineError> {
        if self.is_closed(id) {
            return Err(EngineError::HandleClosed);
        }
        if self.is_active(id) {
            self.stop(id)?;
        }
        let token = self.allocate_token();
        let mut watch = signal::SignalWatch::open(signum, token)?;
        self.poll
            .borrow()
            .registry()
            .register(watch.source_mut(), token, Interest::READABLE)?;
        self.targets.borrow_mut().insert(token, Target::Signal(id));
        self.with_entry(id, |entry| {
            if let Kind::Signal {
                watch: slot,
                cb: cb_slot,
            } = &mut entry.kind
            {
                *slot = Some(watch);
                *cb_slot = Some(cb);
                entry.active = true;
            }
        })
    }

    /// Deactivates the handle, releasing OS interest it holds but keeping it open.
    pub(crate) fn stop(&self, id: HandleId) -> Result<(), EngineError> {
        let mut poll_fd = None;
        let mut signal_watch = None;
        self.with_entry(id, |entry| {
            entry.active = false;
            match &mut entry.kind {
                Kind::Poll { fd, interest, .. } => {
                    if interest.take().is_some() {
                        poll_fd = Some(*fd);
                    }
                    Ok(())
                }
                Kind::Timer { timer, .. } => timer.unset().map_err(EngineError::from),
                Kind::Signal { watch, .. } => {
                    signal_watch = watch.take();
                    Ok(())
                }
                Kind::Prepare { .. } | Kind::Idle { .. } | Kind::Async { .. } => Ok(()),
            }
        })??;
        if let Some(fd) = poll_fd {
            self.detach(id, fd);
        }
        if let Some(mut watch) = signal_watch {
            self.targets.borrow_mut().remove(&watch.token());
            if let Err(err) = self.poll.borrow().registry().deregister(watch.source_mut()) {
                trace!(%err, "signal pipe deregistration failed");
            }
        }
        Ok(())
    }

    /// Stops the handle and drops it from the table. Closing twice is a no-op.
    pub(crate) fn close(&self, id: HandleId) {
        if self.is_closed(id) {
            return;
        }
        if let Err(err) = self.stop(id) {
            trace!(%err, "stop during close failed");
        }
        let Some(entry) = self.entries.borrow_mut().remove(&id) else {
            return;
        };
        if let Kind::Timer { timer, token, .. } = &entry.kind {
            self.targets.borrow_mut().remove(token);
            let fd = timer.as_fd().as_raw_fd();
            if let Err(err) = self.poll.borrow().registry().deregister(&mut SourceFd(&fd)) {
                trace!(%err, "timer deregistration failed");
            }
        }
        // Callbacks captured by the entry drop here, outside any table borrow.
        drop(entry);
    }

    fn attach(&self, id: HandleId, fd: RawFd, interest: Interest) -> Result<(), EngineError> {
        let mut watches = self.watches.borrow_mut();
        let poll = self.poll.borrow();
        let registry = poll.registry();
        match watches.get_mut(&fd) {
            Some(watch) => {
                let busy = (interest.is_readable() && watch.readable.is_some_and(|o| o != id))
                    || (interest.is_writable() && watch.writable.is_some_and(|o| o != id));
                if busy {
                    return Err(EngineError::FdBusy { fd });
                }
                if interest.is_readable() {
                    watch.readable = Some(id);
                }
                if interest.is_writable() {
                    watch.writable = Some(id);
                }
                if let Some(combined) = watch.interest() {
                    registry.reregister(&mut SourceFd(&fd), watch.token, combined)?;
                }
            }
            None => {
                let watch = FdWatch {
                    token: self.allocate_token(),
                    readable: interest.is_readable().then_some(id),
                    writable: interest.is_writable().then_some(id),
                };
                registry.register(&mut SourceFd(&fd), watch.token, interest)?;
                self.targets.borrow_mut().insert(watch.token, Target::Fd(fd));
                watches.insert(fd, watch);
            }
        }
        Ok(())
    }

    fn detach(&self, id: HandleId, fd: RawFd) {
        let mut watches = self.watches.borrow_mut();
        let Some(watch) = watches.get_mut(&fd) else {
            return;
        };
        if watch.readable == Some(id) {
            watch.readable = None;
        }
        if watch.writable == Some(id) {
            watch.writable = None;
        }
        let poll = self.poll.borrow();
        let result = match watch.interest() {
            Some(remaining) => poll
                .registry()
                .reregister(&mut SourceFd(&fd), watch.token, remaining),
            None => {
                let token = watch.token;
                watches.remove(&fd);
                self.targets.borrow_mut().remove(&token);
                poll.registry().deregister(&mut SourceFd(&fd))
            }
        };
        // The fd may already have been closed by its owner.
        if let Err(err) = result {
            trace!(fd, %err, "fd watch update failed");
        }
    }

    /// Re-arms the edge-triggered registration so readiness that was not
    /// consumed is reported again, giving level-triggered poll handles.
    fn rearm(&self, fd: RawFd) {
        let watches = self.watches.borrow();
        let Some(watch) = watches.get(&fd) else {
            return;
        };
        let Some(interest) = watch.interest() else {
            return;
        };
        if let Err(err) =
            self.poll
                .borrow()
                .registry()
                .reregister(&mut SourceFd(&fd), watch.token, interest)
        {
            trace!(fd, %err, "fd re-arm failed");
        }
    }

    fn run(self: &Rc<Self>, mode: RunMode) -> Result<bool, EngineError> {
        if self.running.replace(true) {
            return Err(EngineError::Reentrant);
        }
        let _running = ClearOnDrop(&self.running);

        let mut alive = self.is_alive();
        while alive && !self.stop_flag.get() {
            self.run_idle();
            self.run_prepare();

            let timeout = if mode == RunMode::NoWait
                || self.stop_flag.get()
                || self.idle_pending()
                || !self.is_alive()
            {
                Some(Duration::ZERO)
            } else {
                None
            };
            self.poll_io(timeout)?;

            alive = self.is_alive();
            if mode != RunMode::Default {
                break;
            }
        }

        self.stop_flag.set(false);
        Ok(alive)
    }

    fn active_ids(&self, select: impl Fn(&Kind) -> bool) -> Vec<HandleId> {
        self.entries
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.active && select(&entry.kind))
            .map(|(id, _)| *id)
            .collect()
    }

    fn run_idle(self: &Rc<Self>) {
        for id in self.active_ids(|kind| matches!(kind, Kind::Idle { .. })) {
            let cb = match self.entries.borrow().get(&id) {
                Some(Entry {
                    active: true,
                    kind: Kind::Idle { cb: Some(cb) },
                    ..
                }) => Rc::clone(cb),
                _ => continue,
            };
            let view = IdleHandle::view(Rc::downgrade(self), id);
            (cb.borrow_mut())(&view);
        }
    }

    fn run_prepare(self: &Rc<Self>) {
        for id in self.active_ids(|kind| matches!(kind, Kind::Prepare { .. })) {
            let cb = match self.entries.borrow().get(&id) {
                Some(Entry {
                    active: true,
                    kind: Kind::Prepare { cb: Some(cb) },
                    ..
                }) => Rc::clone(cb),
                _ => continue,
            };
            let view = PrepareHandle::view(Rc::downgrade(self), id);
            (cb.borrow_mut())(&view);
        }
    }

    fn poll_io(self: &Rc<Self>, timeout: Option<Duration>) -> Result<(), EngineError> {
        let ready: Vec<(Token, Ready)> = {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            events
                .iter()
                .map(|event| (event.token(), Ready::from_event(event)))
                .collect()
        };

        for (token, ready) in ready {
            if token == ASYNC_TOKEN {
                self.fire_async();
                continue;
            }
            let target = self.targets.borrow().get(&token).copied();
            match target {
                Some(Target::Fd(fd)) => self.fire_fd(fd, ready),
                Some(Target::Timer(id)) => self.fire_timer(id),
                Some(Target::Signal(id)) => self.fire_signal(id),
                None => {}
            }
        }
        Ok(())
    }

    fn fire_fd(self: &Rc<Self>, fd: RawFd, ready: Ready) {
        let (reader, writer) = match self.watches.borrow().get(&fd) {
            Some(watch) => (watch.readable, watch.writable),
            None => return,
        };
        let mut ids = Vec::with_capacity(2);
        if ready.readable {
            ids.extend(reader);
        }
        if ready.writable {
            if let Some(id) = writer.filter(|id| !ids.contains(id)) {
                ids.push(id);
            }
        }

        for id in ids {
            let cb = match self.entries.borrow().get(&id) {
                Some(Entry {
                    active: true,
                    kind: Kind::Poll { cb: Some(cb), .. },
                    ..
                }) => Rc::clone(cb),
                _ => continue,
            };
            let view = PollHandle::view(Rc::downgrade(self), id);
            (cb.borrow_mut())(&view, ready);
        }

        self.rearm(fd);
    }

    fn fire_timer(self: &Rc<Self>, id: HandleId) {
        let cb = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if !entry.active {
                return;
            }
            let Kind::Timer {
                timer,
                cb: Some(cb),
                ..
            } = &entry.kind
            else {
                return;
            };
            // Clear the expiration count; EAGAIN means a stale wake-up.
            let _ = timer.wait();
            let cb = Rc::clone(cb);
            entry.active = false;
            cb
        };
        let view = TimerHandle::view(Rc::downgrade(self), id);
        (cb.borrow_mut())(&view);
    }

    fn fire_signal(self: &Rc<Self>, id: HandleId) {
        let fired = {
            let mut entries = self.entries.borrow_mut();
            match entries.get_mut(&id) {
                Some(Entry {
                    active: true,
                    kind:
                        Kind::Signal {
                            watch: Some(watch),
                            cb: Some(cb),
                        },
                    ..
                }) => {
                    let delivered = watch.drain();
                    delivered.then(|| (Rc::clone(cb), watch.signum()))
                }
                _ => None,
            }
        };
        if let Some((cb, signum)) = fired {
            let view = SignalHandle::view(Rc::downgrade(self), id);
            (cb.borrow_mut())(&view, signum);
        }
    }

    fn fire_async(self: &Rc<Self>) {
        for id in self.active_ids(|kind| matches!(kind, Kind::Async { .. })) {
            let cb = match self.entries.borrow().get(&id) {
                Some(Entry {
                    active: true,
                    kind: Kind::Async { cb: Some(cb) },
                    ..
                }) => Rc::clone(cb),
                _ => continue,
            };
            let view = AsyncHandle::view(Rc::downgrade(self), id);
            (cb.borrow_mut())(&view);
        }
    }
}

pub(crate) fn upgrade(core: &Weak<LoopCore>) -> Result<Rc<LoopCore>, EngineError> {
    core.upgrade().ok_or(EngineError::LoopDropped)
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::unix::net::UnixStream,
        thread,
    };

    use super::*;

    fn counter() -> Rc<Cell<usize>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn test_run_without_handles_returns_immediately() {
        let lp = Loop::new().unwrap();
        assert!(!lp.run(RunMode::Default).unwrap());
        assert!(!lp.is_running());
    }

    #[test]
    fn test_prepare_runs_once_per_iteration() {
        let lp = Loop::new().unwrap();
        let prepare = PrepareHandle::new(&lp);
        let ctr = counter();
        let ctr_clone = Rc::clone(&ctr);
        prepare
            .start(move |_| ctr_clone.set(ctr_clone.get() + 1))
            .unwrap();

        for _ in 0..3 {
            assert!(lp.run(RunMode::NoWait).unwrap());
        }
        assert_eq!(ctr.get(), 3);
    }

    #[test]
    fn test_unreferenced_handle_does_not_keep_loop_alive() {
        let lp = Loop::new().unwrap();
        let timer = TimerHandle::new(&lp).unwrap();
        let fired = counter();
        let fired_clone = Rc::clone(&fired);
        timer
            .start(Duration::from_secs(60), move |_| fired_clone.set(1))
            .unwrap();
        timer.set_ref(false).unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(fired.get(), 0);
        assert!(timer.is_active());
    }

    #[test]
    fn test_zero_delay_timer_fires_once() {
        let lp = Loop::new().unwrap();
        let timer = TimerHandle::new(&lp).unwrap();
        let fired = counter();
        let fired_clone = Rc::clone(&fired);
        timer
            .start(Duration::ZERO, move |_| fired_clone.set(fired_clone.get() + 1))
            .unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_active());
        assert!(!timer.is_closed());

        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_poll_handle_reports_readable() {
        let lp = Loop::new().unwrap();
        let (rx, mut tx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"x").unwrap();

        let poll = PollHandle::new(&lp, rx.as_raw_fd());
        let seen = Rc::new(Cell::new(None));
        let seen_clone = Rc::clone(&seen);
        poll.start(Interest::READABLE, move |handle, ready| {
            seen_clone.set(Some(ready));
            handle.stop().unwrap();
        })
        .unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        let ready = seen.get().unwrap();
        assert!(ready.readable);
    }

    #[test]
    fn test_reader_and_writer_share_one_fd() {
        let lp = Loop::new().unwrap();
        let (sock, mut peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        peer.write_all(b"ping").unwrap();

        let reader = PollHandle::new(&lp, sock.as_raw_fd());
        let writer = PollHandle::new(&lp, sock.as_raw_fd());
        let reads = counter();
        let writes = counter();
        let reads_clone = Rc::clone(&reads);
        let writes_clone = Rc::clone(&writes);
        reader
            .start(Interest::READABLE, move |handle, _| {
                reads_clone.set(reads_clone.get() + 1);
                handle.stop().unwrap();
            })
            .unwrap();
        writer
            .start(Interest::WRITABLE, move |handle, _| {
                writes_clone.set(writes_clone.get() + 1);
                handle.stop().unwrap();
            })
            .unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(reads.get(), 1);
        assert_eq!(writes.get(), 1);
    }

    #[test]
    fn test_second_reader_on_same_fd_is_rejected() {
        let lp = Loop::new().unwrap();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let first = PollHandle::new(&lp, sock.as_raw_fd());
        let second = PollHandle::new(&lp, sock.as_raw_fd());
        first.start(Interest::READABLE, |_, _| {}).unwrap();

        let err = second.start(Interest::READABLE, |_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::FdBusy { .. }));

        first.close();
        second.start(Interest::READABLE, |_, _| {}).unwrap();
        second.close();
    }

    #[test]
    fn test_level_triggered_until_consumed() {
        let lp = Loop::new().unwrap();
        let (rx, mut tx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"x").unwrap();

        let poll = PollHandle::new(&lp, rx.as_raw_fd());
        let ctr = counter();
        let ctr_clone = Rc::clone(&ctr);
        poll.start(Interest::READABLE, move |handle, _| {
            ctr_clone.set(ctr_clone.get() + 1);
            // Data is left unread on purpose; stop after the third report.
            if ctr_clone.get() == 3 {
                handle.stop().unwrap();
            }
        })
        .unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(ctr.get(), 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let lp = Loop::new().unwrap();
        let idle = IdleHandle::new(&lp);
        idle.start(|_| {}).unwrap();
        assert_eq!(lp.handle_count(), 1);

        idle.close();
        assert!(idle.is_closed());
        idle.close();
        assert_eq!(lp.handle_count(), 0);

        assert!(matches!(idle.stop(), Err(EngineError::HandleClosed)));
        assert!(matches!(idle.set_ref(true), Err(EngineError::HandleClosed)));
    }

    #[test]
    fn test_stop_before_run_is_consumed() {
        let lp = Loop::new().unwrap();
        let idle = IdleHandle::new(&lp);
        let ctr = counter();
        let ctr_clone = Rc::clone(&ctr);
        idle.start(move |_| ctr_clone.set(ctr_clone.get() + 1))
            .unwrap();

        lp.stop();
        assert!(lp.run(RunMode::Default).unwrap());
        assert_eq!(ctr.get(), 0);

        assert!(lp.run(RunMode::NoWait).unwrap());
        assert_eq!(ctr.get(), 1);
    }

    #[test]
    fn test_run_is_not_reentrant() {
        let lp = Rc::new(Loop::new().unwrap());
        let idle = IdleHandle::new(&lp);
        let result = Rc::new(RefCell::new(None));
        let result_clone = Rc::clone(&result);
        let weak = Rc::downgrade(&lp);
        idle.start(move |handle| {
            let lp = weak.upgrade().unwrap();
            *result_clone.borrow_mut() = Some(lp.run(RunMode::NoWait));
            handle.stop().unwrap();
        })
        .unwrap();

        lp.run(RunMode::Default).unwrap();
        let nested = result.borrow_mut().take().unwrap();
        assert!(matches!(nested, Err(EngineError::Reentrant)));
    }

    #[test]
    fn test_async_handle_wakes_from_another_thread() {
        let lp = Loop::new().unwrap();
        let wakeup = AsyncHandle::new(&lp).unwrap();
        let ctr = counter();
        let ctr_clone = Rc::clone(&ctr);
        wakeup
            .start(move |handle| {
                ctr_clone.set(ctr_clone.get() + 1);
                handle.stop().unwrap();
            })
            .unwrap();
        let sender = wakeup.sender().unwrap();

        let remote = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sender.send().unwrap();
        });

        assert!(!lp.run(RunMode::Default).unwrap());
        remote.join().unwrap();
        assert_eq!(ctr.get(), 1);

        assert!(matches!(
            AsyncHandle::new(&lp),
            Err(EngineError::AsyncInUse)
        ));
    }

    #[test]
    fn test_signal_handle_delivers_signal() {
        let lp = Loop::new().unwrap();
        let watcher = SignalHandle::new(&lp);
        let seen = Rc::new(Cell::new(None));
        let seen_clone = Rc::clone(&seen);
        watcher
            .start(Signal::SIGUSR1, move |handle, signum| {
                seen_clone.set(Some(signum));
                handle.stop().unwrap();
            })
            .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(seen.get(), Some(Signal::SIGUSR1));
        watcher.close();
    }
}
