//! Bounded fiber pool.
//!
//! A [`GreenPool`] caps how many of its fibers may be alive at once. Spawning
//! into a full pool suspends the spawner until a running fiber finishes.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{Future, poll_fn},
    mem,
    rc::Rc,
    task::{Poll, Waker},
};

use crate::spawner::{self, JoinHandle};

#[derive(Clone)]
pub struct GreenPool {
    inner: Rc<PoolInner>,
}

struct PoolInner {
    size: usize,
    running: Cell<usize>,
    /// Spawners waiting for a free slot.
    waiters: RefCell<Vec<Waker>>,
    /// Callers of `waitall`.
    idle: RefCell<Vec<Waker>>,
}

/// A claimed slot, released when the pooled fiber ends however it ends.
struct Permit {
    pool: Rc<PoolInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let running = self.pool.running.get() - 1;
        self.pool.running.set(running);
        let waiters = mem::take(&mut *self.pool.waiters.borrow_mut());
        waiters.into_iter().for_each(Waker::wake);
        if running == 0 {
            let idle = mem::take(&mut *self.pool.idle.borrow_mut());
            idle.into_iter().for_each(Waker::wake);
        }
    }
}

fn register(wakers: &RefCell<Vec<Waker>>, waker: &Waker) {
    let mut wakers = wakers.borrow_mut();
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

impl GreenPool {
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a GreenPool needs room for at least one fiber");
        Self {
            inner: Rc::new(PoolInner {
                size,
                running: Cell::new(0),
                waiters: RefCell::new(Vec::new()),
                idle: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of pooled fibers alive right now.
    pub fn running(&self) -> usize {
        self.inner.running.get()
    }

    /// Number of fibers that could be spawned without waiting.
    pub fn free(&self) -> usize {
        self.inner.size - self.inner.running.get()
    }

    async fn acquire(&self) -> Permit {
        poll_fn(|cx| {
            if self.inner.running.get() < self.inner.size {
                self.inner.running.set(self.inner.running.get() + 1);
                return Poll::Ready(Permit {
                    pool: Rc::clone(&self.inner),
                });
            }
            register(&self.inner.waiters, cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Spawns `future` once a slot is free and returns its join handle.
    pub async fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let permit = self.acquire().await;
        spawner::spawn(async move {
            let _permit = permit;
            future.await
        })
    }

    /// Spawns `future` once a slot is free, without a join handle.
    pub async fn spawn_n<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let permit = self.acquire().await;
        spawner::spawn_n(async move {
            let _permit = permit;
            future.await
        })
    }

    /// Waits until no pooled fiber is running.
    pub async fn waitall(&self) {
        poll_fn(|cx| {
            if self.inner.running.get() == 0 {
                return Poll::Ready(());
            }
            register(&self.inner.idle, cx.waker());
            Poll::Pending
        })
        .await
    }
}

impl fmt::Debug for GreenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreenPool")
            .field("size", &self.size())
            .field("running", &self.running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{runtime::RuntimeBuilder, time::sleep};

    #[test]
    #[should_panic]
    fn test_zero_sized_pool_panics() {
        GreenPool::new(0);
    }

    #[test]
    fn test_pool_caps_concurrency() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let peak = Rc::new(Cell::new(0));
        let live = Rc::new(Cell::new(0));

        let pool = GreenPool::new(2);
        let pool_clone = pool.clone();
        let peak_clone = Rc::clone(&peak);
        handle
            .block_on(async move {
                for _ in 0..5 {
                    let live = Rc::clone(&live);
                    let peak = Rc::clone(&peak_clone);
                    pool_clone
                        .spawn_n(async move {
                            live.set(live.get() + 1);
                            peak.set(peak.get().max(live.get()));
                            sleep(Duration::from_millis(5)).await.unwrap();
                            live.set(live.get() - 1);
                        })
                        .await;
                    assert!(pool_clone.running() <= 2);
                }
                pool_clone.waitall().await;
            })
            .unwrap();

        assert_eq!(peak.get(), 2);
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.free(), 2);
    }

    #[test]
    fn test_repolled_spawner_waits_once() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let pool = GreenPool::new(1);
        let pool_clone = pool.clone();
        handle
            .block_on(async move {
                pool_clone.spawn_n(sleep_briefly()).await;
                let mut blocked = std::pin::pin!(pool_clone.spawn_n(async {}));
                for _ in 0..3 {
                    poll_fn(|cx| {
                        assert!(blocked.as_mut().poll(cx).is_pending());
                        Poll::Ready(())
                    })
                    .await;
                }
                assert_eq!(pool_clone.inner.waiters.borrow().len(), 1);
                blocked.await;
                pool_clone.waitall().await;
            })
            .unwrap();
        assert_eq!(pool.running(), 0);
    }

    async fn sleep_briefly() {
        sleep(Duration::from_millis(5)).await.unwrap();
    }

    async fn explode() -> u32 {
        panic!("pooled fiber exploded")
    }

    #[test]
    fn test_panicking_fiber_frees_its_slot() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let pool = GreenPool::new(1);
        let pool_clone = pool.clone();
        let out = handle
            .block_on(async move {
                let failed = pool_clone.spawn(explode()).await;
                assert!(failed.await.is_err());
                pool_clone.spawn(async { 3 }).await.await
            })
            .unwrap();
        assert_eq!(out.unwrap(), 3);
        assert_eq!(pool.running(), 0);
    }
}
