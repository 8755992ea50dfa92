use std::{
    cell::RefCell,
    fmt,
    os::fd::RawFd,
    rc::{Rc, Weak},
};

use mio::Interest;

use crate::engine::PollHandle;

/// What a [`Listener`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Writable,
}

impl EventKind {
    pub(crate) fn interest(self) -> Interest {
        match self {
            EventKind::Readable => Interest::READABLE,
            EventKind::Writable => Interest::WRITABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) usize);

/// A live `(kind, fd)` registration on a hub, and the token used to remove it.
///
/// The fd is borrowed: whoever created it keeps it open for as long as the
/// listener is registered.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    id: ListenerId,
    kind: EventKind,
    fd: RawFd,
    handle: RefCell<Option<PollHandle>>,
}

impl Listener {
    pub(crate) fn new(id: ListenerId, kind: EventKind, fd: RawFd, handle: PollHandle) -> Self {
        Self {
            inner: Rc::new(ListenerInner {
                id,
                kind,
                fd,
                handle: RefCell::new(Some(handle)),
            }),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    pub fn kind(&self) -> EventKind {
        self.inner.kind
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// True once the hub has released the poll handle.
    pub fn is_removed(&self) -> bool {
        self.inner.handle.borrow().is_none()
    }

    pub(crate) fn handle(&self) -> &RefCell<Option<PollHandle>> {
        &self.inner.handle
    }

    pub(crate) fn downgrade(&self) -> WeakListener {
        WeakListener(Rc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("fd", &self.inner.fd)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Held by the listener's own callback so it does not keep itself alive.
pub(crate) struct WeakListener(Weak<ListenerInner>);

impl WeakListener {
    pub(crate) fn upgrade(&self) -> Option<Listener> {
        self.0.upgrade().map(|inner| Listener { inner })
    }
}
