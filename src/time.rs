use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use crate::{
    error::HubError,
    hub::{Hub, Timer, Wakeup},
};

pub mod timeout;

pub use timeout::{TimeoutError, timeout};

/// Suspends the calling fiber for `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        timer: None,
        wakeup: Wakeup::new(),
    }
}

/// Future returned by [`sleep`]. The hub timer is armed on first poll and
/// cancelled if the future is dropped early.
pub struct Sleep {
    duration: Duration,
    timer: Option<Timer>,
    wakeup: Rc<Wakeup>,
}

impl Future for Sleep {
    type Output = Result<(), HubError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.wakeup.is_fired() {
            return Poll::Ready(Ok(()));
        }
        if self.timer.is_none() {
            let wakeup = Rc::clone(&self.wakeup);
            let timer = Hub::try_current()?
                .schedule_call_global(self.duration, move || wakeup.fire())?;
            self.timer = Some(timer);
        }
        self.wakeup.register(cx.waker());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}
