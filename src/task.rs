use std::{
    sync::Arc,
    task::{RawWaker, RawWakerVTable, Waker},
    thread::{self, ThreadId},
};

use crate::{
    executor::{RemoteQueue, TaskId},
    hub::Hub,
};

/// Waker for a fiber. On the hub's own thread it schedules the fiber directly;
/// from any other thread it goes through the hub's remote queue.
pub(crate) struct TaskWaker {
    hub: usize,
    task: TaskId,
    thread: ThreadId,
    remote: Arc<RemoteQueue>,
}

impl TaskWaker {
    /// The waker virtual table used to handle task waking functionality.
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

    pub(crate) fn new(hub: usize, task: TaskId, remote: Arc<RemoteQueue>) -> Self {
        Self {
            hub,
            task,
            thread: thread::current().id(),
            remote,
        }
    }

    pub(crate) fn into_waker(self) -> Waker {
        let opaque_ptr = Arc::into_raw(Arc::new(self)) as *const ();
        let vtable = &Self::WAKER_VTABLE;
        // SAFETY: the pointer comes from `Arc::into_raw` and every vtable entry
        // treats it as an `Arc<TaskWaker>`.
        unsafe { Waker::from_raw(RawWaker::new(opaque_ptr, vtable)) }
    }

    fn wake_task(&self) {
        if thread::current().id() == self.thread {
            if let Some(hub) = Hub::lookup(self.hub) {
                hub.executor.schedule(&hub, self.task);
                return;
            }
        }
        self.remote.push(self.task);
    }
}

/// Clones a `RawWaker` pointer, incrementing the reference count.
fn clone(ptr: *const ()) -> RawWaker {
    // SAFETY: `ptr` was produced by `Arc::into_raw::<TaskWaker>`.
    unsafe { Arc::increment_strong_count(ptr as *const TaskWaker) };
    RawWaker::new(ptr, &TaskWaker::WAKER_VTABLE)
}

/// Drops a `RawWaker`, decrementing the reference count.
fn drop(ptr: *const ()) {
    // SAFETY: `ptr` was produced by `Arc::into_raw::<TaskWaker>`.
    let _: Arc<TaskWaker> = unsafe { Arc::from_raw(ptr as _) };
}

/// Wakes the task, consuming the waker.
fn wake(ptr: *const ()) {
    // SAFETY: `ptr` was produced by `Arc::into_raw::<TaskWaker>`.
    let waker: Arc<TaskWaker> = unsafe { Arc::from_raw(ptr as _) };
    waker.wake_task();
}

/// Wakes the task by reference without consuming the `Arc`.
fn wake_by_ref(ptr: *const ()) {
    // SAFETY: `ptr` was produced by `Arc::into_raw::<TaskWaker>` and stays valid
    // for the duration of this call.
    let waker = unsafe { &*(ptr as *const TaskWaker) };
    waker.wake_task();
}
