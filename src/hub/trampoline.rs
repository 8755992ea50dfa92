use std::{
    cell::{Cell, RefCell},
    future::Future,
    os::fd::RawFd,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use tracing::warn;

use super::{EventKind, Hub, Listener};
use crate::error::HubError;

/// One-shot wake-up shared between a hub callback and the fiber waiting on it.
#[derive(Default)]
pub(crate) struct Wakeup {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Wakeup {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub(crate) fn fire(&self) {
        self.fired.set(true);
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.get()
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.borrow_mut();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

/// Suspends the calling fiber until `fd` is ready for `kind`.
///
/// A listener is registered on the first poll and removed as soon as the
/// fiber resumes or the future is dropped.
pub fn wait(fd: RawFd, kind: EventKind) -> Readiness {
    Readiness {
        fd,
        kind,
        hub: Weak::new(),
        listener: None,
        wakeup: Wakeup::new(),
    }
}

/// Future returned by [`wait`].
pub struct Readiness {
    fd: RawFd,
    kind: EventKind,
    hub: Weak<Hub>,
    listener: Option<Listener>,
    wakeup: Rc<Wakeup>,
}

impl Readiness {
    fn unregister(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        // The error callback may already have removed it.
        if listener.is_removed() {
            return;
        }
        if let Err(err) = hub.remove(&listener) {
            warn!(fd = self.fd, %err, "failed to remove listener");
        }
    }
}

impl Future for Readiness {
    type Output = Result<(), HubError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.wakeup.is_fired() {
            self.unregister();
            return Poll::Ready(Ok(()));
        }

        if self.listener.is_none() {
            let hub = Hub::try_current()?;
            let on_ready = Rc::clone(&self.wakeup);
            let on_error = Rc::clone(&self.wakeup);
            let listener = hub.add(
                self.kind,
                self.fd,
                move || on_ready.fire(),
                move || on_error.fire(),
            )?;
            self.hub = Rc::downgrade(&hub);
            self.listener = Some(listener);
        }

        self.wakeup.register(cx.waker());
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        self.unregister();
    }
}
