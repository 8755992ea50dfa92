use std::{
    future::poll_fn,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, RecvError, SendError, SyncSender, TryRecvError, TrySendError},
    },
    task::{Context, Poll, Waker},
};

use crate::{executor::RemoteHold, hub::Hub};

/// State shared by every sender and the receiver.
#[derive(Debug)]
struct Shared {
    wakers: Mutex<Vec<Waker>>,
    senders: AtomicUsize,
}

impl Shared {
    fn register(&self, waker: &Waker) {
        let mut wakers = match self.wakers.lock() {
            Ok(wakers) => wakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake(&self) {
        let wakers = match self.wakers.lock() {
            Ok(mut wakers) => std::mem::take(&mut *wakers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        wakers.into_iter().for_each(Waker::wake);
    }
}

/// Sending half of [`bounded_channel`]. May be used from any thread.
#[derive(Debug)]
pub struct BoundedSender<T> {
    // Only `None` while dropping, so the receiver sees the disconnect before
    // it is woken.
    sender: Option<SyncSender<T>>,
    shared: Arc<Shared>,
}

impl<T> BoundedSender<T> {
    /// Sends `val`, blocking the calling thread while the channel is full.
    pub fn send(&self, val: T) -> Result<(), SendError<T>> {
        let Some(sender) = &self.sender else {
            return Err(SendError(val));
        };
        sender.send(val)?;
        self.shared.wake();
        Ok(())
    }

    pub fn try_send(&self, val: T) -> Result<(), TrySendError<T>> {
        let Some(sender) = &self.sender else {
            return Err(TrySendError::Disconnected(val));
        };
        sender.try_send(val)?;
        self.shared.wake();
        Ok(())
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for BoundedSender<T> {
    fn drop(&mut self) {
        drop(self.sender.take());
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.wake();
        }
    }
}

/// Receiving half of [`bounded_channel`], awaited from a fiber.
#[derive(Debug)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> BoundedReceiver<T> {
    /// Waits for the next value. Fails once every sender is gone and the
    /// channel is drained.
    pub async fn recv(&self) -> Result<T, RecvError> {
        // Keeps the hub alive while the only thing that can wake us lives on
        // another thread.
        let mut hold: Option<RemoteHold> = None;
        poll_fn(|cx| {
            let ready = self.poll_recv(cx);
            if ready.is_pending() && hold.is_none() {
                hold = Hub::try_current().ok().map(|hub| RemoteHold::new(&hub));
            }
            ready
        })
        .await
    }

    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        if let Some(ready) = self.ready() {
            return Poll::Ready(ready);
        }
        self.shared.register(cx.waker());
        match self.ready() {
            Some(ready) => Poll::Ready(ready),
            None => Poll::Pending,
        }
    }

    fn ready(&self) -> Option<Result<T, RecvError>> {
        match self.rx.try_recv() {
            Ok(val) => Some(Ok(val)),
            Err(TryRecvError::Disconnected) => Some(Err(RecvError)),
            Err(TryRecvError::Empty) => None,
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Creates a channel holding at most `bound` values. Senders may live on any
/// thread; the receiver is awaited on a hub.
pub fn bounded_channel<T>(bound: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = std::sync::mpsc::sync_channel(bound);
    let shared = Arc::new(Shared {
        wakers: Mutex::new(Vec::new()),
        senders: AtomicUsize::new(1),
    });
    (
        BoundedSender {
            sender: Some(tx),
            shared: Arc::clone(&shared),
        },
        BoundedReceiver { rx, shared },
    )
}
