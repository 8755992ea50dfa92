use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;

use super::{Sleep, sleep};
use crate::error::HubError;

/// Runs `fut` for at most `duration`. The future is dropped if the deadline
/// passes first.
pub async fn timeout<Fut>(fut: Fut, duration: Duration) -> Result<Fut::Output, TimeoutError>
where
    Fut: Future,
{
    Timeout {
        fut: Box::pin(fut),
        sleep: sleep(duration),
    }
    .await
}

pub struct Timeout<Fut: Future> {
    fut: Pin<Box<Fut>>,
    sleep: Sleep,
}

impl<Fut: Future> Future for Timeout<Fut> {
    type Output = Result<Fut::Output, TimeoutError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(value) = self.fut.as_mut().poll(cx) {
            return Poll::Ready(Ok(value));
        }

        match Pin::new(&mut self.sleep).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(TimeoutError::Elapsed)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(TimeoutError::Hub(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("deadline elapsed")]
    Elapsed,
    #[error(transparent)]
    Hub(#[from] HubError),
}
