//! Spawning fibers on the current thread's hub and awaiting their results.
//!
//! [`spawn`] defers the first poll to the next loop iteration, [`spawn_now`]
//! hands control to the new fiber immediately, and [`spawn_n`] spawns a fiber
//! nobody will join.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use thiserror::Error;

use crate::{
    executor::{TaskFuture, TaskId},
    hub::Hub,
};

/// Why a fiber produced no value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("task panicked")]
    Panicked,
    #[error("task was cancelled")]
    Cancelled,
}

pub(crate) struct JoinState<T> {
    result: Option<Result<T, JoinError>>,
    done: bool,
    waker: Option<Waker>,
    on_complete: Option<Box<dyn FnOnce()>>,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            result: None,
            done: false,
            waker: None,
            on_complete: None,
        }
    }

    /// Records the outcome once; later outcomes are ignored.
    fn complete(state: &RefCell<Self>, result: Result<T, JoinError>) {
        let (waker, hook) = {
            let mut state = state.borrow_mut();
            if state.done {
                return;
            }
            state.done = true;
            state.result = Some(result);
            (state.waker.take(), state.on_complete.take())
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Wraps `future` so its output lands in a shared join state.
pub(crate) fn bind<F>(future: F) -> (TaskFuture, Rc<RefCell<JoinState<F::Output>>>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(RefCell::new(JoinState::new()));
    let on_done = Rc::clone(&state);
    let on_abort = Rc::downgrade(&state);
    let task = TaskFuture::new(
        Box::pin(async move {
            let output = future.await;
            JoinState::complete(&on_done, Ok(output));
        }),
        Box::new(move |err| {
            if let Some(state) = on_abort.upgrade() {
                JoinState::complete(&state, Err(err));
            }
        }),
    );
    (task, state)
}

/// Awaits a fiber's output.
///
/// Dropping the handle detaches the fiber; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
    hub: Weak<Hub>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, state: Rc<RefCell<JoinState<T>>>, hub: Weak<Hub>) -> Self {
        Self { id, state, hub }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancels the fiber by dropping its future at its current suspension point.
    pub fn abort(&self) {
        if self.is_finished() {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.executor.cancel(self.id);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().done
    }

    /// Runs `hook` once the fiber finishes, or right away if it already has.
    pub(crate) fn on_complete(&self, hook: impl FnOnce() + 'static) {
        if self.is_finished() {
            hook();
            return;
        }
        self.state.borrow_mut().on_complete = Some(Box::new(hook));
    }

    pub(crate) fn try_take(&self) -> Option<Result<T, JoinError>> {
        self.state.borrow_mut().result.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        assert!(!state.done, "JoinHandle polled after completion");
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Spawns a fiber on the current thread's hub.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Hub::current().spawn(future)
}

/// Spawns a detached fiber on the current thread's hub.
pub fn spawn_n<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    Hub::current().spawn_n(future)
}

/// Spawns a fiber and runs it up to its first suspension point before returning.
pub fn spawn_now<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Hub::current().spawn_now(future)
}

/// Lets every other runnable fiber go first.
pub async fn yield_now() {
    let mut yielded = false;
    std::future::poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::runtime::RuntimeBuilder;

    #[test]
    fn test_join_handle_returns_output() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let res = handle
            .block_on(async {
                let task = spawn(async { "done" });
                task.await
            })
            .unwrap();
        assert_eq!(res, Ok("done"));
    }

    #[test]
    fn test_on_complete_runs_once() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = Rc::clone(&calls);
        handle
            .block_on(async move {
                let task = spawn(async {});
                task.on_complete(move || calls_clone.set(calls_clone.get() + 1));
                task.await.unwrap();
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_dropped_join_handle_detaches() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = Rc::clone(&ran);
        handle
            .block_on(async move {
                drop(spawn(async move {
                    yield_now().await;
                    ran_clone.set(true);
                }));
                yield_now().await;
                yield_now().await;
            })
            .unwrap();
        assert!(ran.get());
    }
}
