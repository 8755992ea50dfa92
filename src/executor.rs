//! The hub's fiber executor.
//!
//! Fibers are boxed futures kept in a table on the hub thread. A fiber is
//! polled from a callback queued with [`Hub::schedule_call_now`], so task
//! polls interleave with every other piece of deferred work in FIFO order.
//! Wake-ups from other threads go through a shared queue and the loop's
//! async handle.
//!
//! A panic while polling a fiber is caught, logged and ends that fiber only.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::{Rc, Weak},
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

use tracing::{trace, warn};

use crate::{
    engine::{AsyncHandle, AsyncSender, Loop, NativeHandle},
    error::EngineError,
    hub::{Hub, squelch},
    spawner::JoinError,
    task::TaskWaker,
};

pub(crate) type LocalBoxFuture = Pin<Box<dyn Future<Output = ()>>>;
pub(crate) type AbortFn = Box<dyn FnOnce(JoinError)>;

/// Identifies a fiber within its hub.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct TaskId(usize);

impl TaskId {
    pub fn get(&self) -> usize {
        self.0
    }
}

/// A fiber's future plus what to do if it never finishes.
pub(crate) struct TaskFuture {
    future: LocalBoxFuture,
    on_abort: Option<AbortFn>,
}

impl TaskFuture {
    pub(crate) fn new(future: LocalBoxFuture, on_abort: AbortFn) -> Self {
        Self {
            future,
            on_abort: Some(on_abort),
        }
    }

    pub(crate) fn detached<F>(future: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self {
            future: Box::pin(future),
            on_abort: None,
        }
    }
}

struct Task {
    /// `None` while the future is being polled.
    future: Option<LocalBoxFuture>,
    scheduled: bool,
    on_abort: Option<AbortFn>,
    /// Built on first poll and handed out on every later one, so wakers
    /// stored by the fiber compare equal with `will_wake`.
    waker: Option<Waker>,
}

impl Task {
    fn abort(&mut self, reason: JoinError) {
        if let Some(on_abort) = self.on_abort.take() {
            on_abort(reason);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.abort(JoinError::Cancelled);
    }
}

/// Wake-ups posted from threads other than the hub's.
pub(crate) struct RemoteQueue {
    ids: Mutex<Vec<TaskId>>,
    sender: AsyncSender,
}

impl RemoteQueue {
    pub(crate) fn push(&self, id: TaskId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        if let Err(err) = self.sender.send() {
            warn!(%err, "failed to wake the hub from another thread");
        }
    }

    fn take(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub(crate) struct Executor {
    tasks: RefCell<HashMap<TaskId, Task>>,
    next_id: Cell<usize>,
    wakeup: AsyncHandle,
    remote: Arc<RemoteQueue>,
    remote_holds: Cell<usize>,
}

impl Executor {
    pub(crate) fn new(engine: &Loop) -> Result<Self, EngineError> {
        let wakeup = AsyncHandle::new(engine)?;
        let sender = wakeup.sender()?;
        Ok(Self {
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            wakeup,
            remote: Arc::new(RemoteQueue {
                ids: Mutex::new(Vec::new()),
                sender,
            }),
            remote_holds: Cell::new(0),
        })
    }

    /// Starts listening for cross-thread wake-ups. The async handle stays
    /// unreferenced until a fiber waits on another thread.
    pub(crate) fn start(&self, hub: Weak<Hub>) -> Result<(), EngineError> {
        self.wakeup.start(move |_| {
            if let Some(hub) = hub.upgrade() {
                for id in hub.executor.remote.take() {
                    hub.executor.schedule(&hub, id);
                }
            }
        })?;
        self.wakeup.set_ref(false)
    }

    pub(crate) fn insert(&self, task: TaskFuture) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let TaskFuture { future, on_abort } = task;
        self.tasks.borrow_mut().insert(
            id,
            Task {
                future: Some(future),
                scheduled: false,
                on_abort,
                waker: None,
            },
        );
        id
    }

    /// Queues one poll of the task. Repeated wake-ups before that poll collapse.
    pub(crate) fn schedule(&self, hub: &Rc<Hub>, id: TaskId) {
        {
            let mut tasks = self.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            if task.scheduled {
                return;
            }
            task.scheduled = true;
        }
        let weak = Rc::downgrade(hub);
        hub.schedule_call_now(move || {
            if let Some(hub) = weak.upgrade() {
                hub.executor.poll(&hub, id);
            }
        });
    }

    pub(crate) fn poll(&self, hub: &Rc<Hub>, id: TaskId) {
        let (mut future, waker) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            task.scheduled = false;
            let future = match task.future.take() {
                Some(future) => future,
                // Already being polled further up the stack.
                None => return,
            };
            let waker = task
                .waker
                .get_or_insert_with(|| {
                    TaskWaker::new(hub.id(), id, Arc::clone(&self.remote)).into_waker()
                })
                .clone();
            (future, waker)
        };

        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                let orphan = {
                    let mut tasks = self.tasks.borrow_mut();
                    match tasks.get_mut(&id) {
                        Some(task) => {
                            task.future = Some(future);
                            None
                        }
                        // Cancelled while it was running.
                        None => Some(future),
                    }
                };
                drop(orphan);
            }
            Ok(Poll::Ready(())) => {
                let task = self.tasks.borrow_mut().remove(&id);
                if let Some(mut task) = task {
                    task.on_abort = None;
                }
                trace!(task = id.0, "task finished");
            }
            Err(panic) => {
                squelch(panic, "task");
                let task = self.tasks.borrow_mut().remove(&id);
                drop(future);
                if let Some(mut task) = task {
                    task.abort(JoinError::Panicked);
                }
            }
        }
    }

    /// Drops the task's future. Its join handle resolves to `Cancelled`.
    pub(crate) fn cancel(&self, id: TaskId) {
        let task = self.tasks.borrow_mut().remove(&id);
        drop(task);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Keeps the loop alive while a fiber waits for a wake-up from another thread.
    pub(crate) fn hold_remote(&self) {
        let holds = self.remote_holds.get() + 1;
        self.remote_holds.set(holds);
        if holds == 1 {
            if let Err(err) = self.wakeup.set_ref(true) {
                warn!(%err, "failed to reference the async handle");
            }
        }
    }

    pub(crate) fn release_remote(&self) {
        let holds = self.remote_holds.get().saturating_sub(1);
        self.remote_holds.set(holds);
        if holds == 0 {
            if let Err(err) = self.wakeup.set_ref(false) {
                warn!(%err, "failed to unreference the async handle");
            }
        }
    }
}

/// Keeps a hub's async handle referenced while alive.
pub(crate) struct RemoteHold {
    hub: Weak<Hub>,
}

impl RemoteHold {
    pub(crate) fn new(hub: &Rc<Hub>) -> Self {
        hub.executor.hold_remote();
        Self {
            hub: Rc::downgrade(hub),
        }
    }
}

impl Drop for RemoteHold {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.executor.release_remote();
        }
    }
}
