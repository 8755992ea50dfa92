//! TCP server harness.
//!
//! A [`ServerLoop`] owns a listening socket and a connection handler. Its
//! accept loop hands every connection to a fresh fiber, either directly
//! ([`Dispatch::Bare`]) or through a [`GreenPool`] that bounds how many
//! handlers run at once. [`StopServe`] ends the loop gracefully.

use std::{
    cell::Cell,
    fmt,
    future::{Future, poll_fn},
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::pin,
    rc::Rc,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Poll, Waker},
};

use tracing::{debug, error};

use crate::{
    error::ServerError,
    hub::Hub,
    net::{TcpListener, TcpStream},
    pool::GreenPool,
};

/// Pool size used by [`serve`] when the caller has no preference.
pub const DEFAULT_CONCURRENCY: usize = 1000;

/// Connection handler run in its own fiber for every accepted connection.
pub trait Handler: 'static {
    type Future: Future<Output = ()> + 'static;

    fn call(&self, stream: TcpStream, addr: SocketAddr) -> Self::Future;
}

impl<F, Fut> Handler for F
where
    F: Fn(TcpStream, SocketAddr) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    type Future = Fut;

    fn call(&self, stream: TcpStream, addr: SocketAddr) -> Self::Future {
        self(stream, addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopped,
}

/// Which pool operation a pooled server spawns handlers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSpawn {
    /// [`GreenPool::spawn`]; the join handle is dropped.
    Spawn,
    /// [`GreenPool::spawn_n`].
    SpawnN,
}

/// How accepted connections reach their handler fiber.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Switch straight into a new fiber before accepting again.
    Bare,
    /// Ask the pool for a slot, waiting while it is full.
    Pool(GreenPool, PoolSpawn),
}

/// The operations every server harness provides.
pub trait Server {
    /// Runs the accept loop until the server is stopped.
    ///
    /// A graceful stop resolves to `Ok(())`. Any other failure is logged with
    /// the server's address, stops the server and is returned.
    fn start(&self) -> impl Future<Output = Result<(), ServerError>>;

    fn stop(&self);

    fn address(&self) -> SocketAddr;

    fn state(&self) -> ServerState;
}

/// Cancellation token for a server's accept loop.
///
/// Clones share the same flag and may be moved to other threads. Several
/// servers may share one token; stopping it ends all of them.
#[derive(Debug, Clone, Default)]
pub struct StopServe {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    next_race: AtomicU64,
    /// One waker per race in progress, keyed by race id.
    wakers: Mutex<Vec<(u64, Waker)>>,
}

impl StopInner {
    fn wakers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Waker)>> {
        self.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A race's waker slot, emptied when the race resolves or is dropped.
struct RaceSlot<'a> {
    inner: &'a StopInner,
    id: u64,
}

impl RaceSlot<'_> {
    fn register(&self, waker: &Waker) {
        let mut wakers = self.inner.wakers();
        match wakers.iter_mut().find(|(id, _)| *id == self.id) {
            Some((_, current)) if current.will_wake(waker) => {}
            Some((_, current)) => *current = waker.clone(),
            None => wakers.push((self.id, waker.clone())),
        }
    }
}

impl Drop for RaceSlot<'_> {
    fn drop(&mut self) {
        self.inner.wakers().retain(|(id, _)| *id != self.id);
    }
}

impl StopServe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks every accept loop using this token to return.
    pub fn stop_serving(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let wakers = std::mem::take(&mut *self.inner.wakers());
        wakers.into_iter().for_each(|(_, waker)| waker.wake());
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Re-arms the token so the servers it stopped can be started again.
    pub fn reset(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Polls `fut` until it completes or the token is stopped, whichever
    /// comes first. `None` means the token won and `fut` was dropped.
    pub async fn race<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut fut = pin!(fut);
        let slot = RaceSlot {
            inner: &self.inner,
            id: self.inner.next_race.fetch_add(1, Ordering::Relaxed),
        };
        poll_fn(|cx| {
            slot.register(cx.waker());
            if self.is_stopped() {
                return Poll::Ready(None);
            }
            fut.as_mut().poll(cx).map(Some)
        })
        .await
    }
}

/// Accept loop over one listening socket.
pub struct ServerLoop<H: Handler> {
    listener: TcpListener,
    address: SocketAddr,
    handler: Rc<H>,
    dispatch: Dispatch,
    state: Cell<ServerState>,
    token: StopServe,
}

impl<H: Handler> ServerLoop<H> {
    pub fn new(listener: TcpListener, handler: H, dispatch: Dispatch) -> io::Result<Self> {
        let address = listener.local_addr()?;
        Ok(Self {
            listener,
            address,
            handler: Rc::new(handler),
            dispatch,
            state: Cell::new(ServerState::Created),
            token: StopServe::new(),
        })
    }

    /// Replaces the server's own stop token with `token`.
    pub fn with_stop_token(mut self, token: StopServe) -> Self {
        self.token = token;
        self
    }

    pub fn stop_token(&self) -> StopServe {
        self.token.clone()
    }

    async fn accept_loop(&self) -> Result<(), ServerError> {
        loop {
            let Some(accepted) = self.token.race(self.listener.accept()).await else {
                return Ok(());
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("{self}: accepted {addr}");
                    if self.token.race(self.spawn(stream, addr)).await.is_none() {
                        return Ok(());
                    }
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::ConnectionAborted | ErrorKind::Interrupted) =>
                {
                    debug!("{self}: transient accept error: {err}");
                }
                Err(err) => return Err(ServerError::Accept(err)),
            }
        }
    }

    async fn spawn(&self, stream: TcpStream, addr: SocketAddr) {
        let handler = Rc::clone(&self.handler);
        let fut = async move { handler.call(stream, addr).await };
        match &self.dispatch {
            Dispatch::Bare => {
                Hub::current().spawn_now(fut);
            }
            Dispatch::Pool(pool, PoolSpawn::Spawn) => {
                pool.spawn(fut).await;
            }
            Dispatch::Pool(pool, PoolSpawn::SpawnN) => pool.spawn_n(fut).await,
        }
    }
}

impl<H: Handler> Server for ServerLoop<H> {
    /// Starting a server whose token is already stopped returns right away;
    /// call [`StopServe::reset`] first to serve again.
    async fn start(&self) -> Result<(), ServerError> {
        self.state.set(ServerState::Running);
        debug!("{self}: starting");

        match self.accept_loop().await {
            Ok(()) => {
                debug!("{self}: stop requested");
                self.stop();
                Ok(())
            }
            Err(err) => {
                error!("{self}: {err} --> closing");
                self.stop();
                Err(err)
            }
        }
    }

    /// Records the transition to [`ServerState::Stopped`]. The stop token is
    /// left alone since other servers may share it; stop the token to end a
    /// running accept loop.
    fn stop(&self) {
        if self.state.replace(ServerState::Stopped) != ServerState::Stopped {
            debug!("{self}: stopped");
        }
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn state(&self) -> ServerState {
        self.state.get()
    }
}

impl<H: Handler> fmt::Display for ServerLoop<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerLoop({})", self.address)
    }
}

impl<H: Handler> fmt::Debug for ServerLoop<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLoop")
            .field("address", &self.address)
            .field("dispatch", &self.dispatch)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Serves `listener` with `handler`, running at most `concurrency` handlers
/// at once. Returns once the server is stopped.
pub async fn serve<H: Handler>(
    listener: TcpListener,
    handler: H,
    concurrency: usize,
) -> Result<(), ServerError> {
    serve_with_token(listener, handler, concurrency, StopServe::new()).await
}

/// Like [`serve`], stopping gracefully when `token` is stopped.
pub async fn serve_with_token<H: Handler>(
    listener: TcpListener,
    handler: H,
    concurrency: usize,
    token: StopServe,
) -> Result<(), ServerError> {
    let pool = GreenPool::new(concurrency);
    let server = ServerLoop::new(listener, handler, Dispatch::Pool(pool, PoolSpawn::SpawnN))?
        .with_stop_token(token);
    server.start().await
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        thread,
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::runtime::RuntimeBuilder;

    fn bound() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_display_names_address() {
        let (listener, addr) = bound();
        let server = ServerLoop::new(listener, |_: TcpStream, _: SocketAddr| async {}, Dispatch::Bare)
            .unwrap();
        assert_eq!(server.to_string(), format!("ServerLoop({addr})"));
        assert_eq!(server.state(), ServerState::Created);
        assert_eq!(server.address(), addr);
    }

    #[test]
    #[traced_test]
    fn test_stop_serving_from_handler_is_graceful() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let (listener, addr) = bound();
        let token = StopServe::new();

        let handler_token = token.clone();
        let server = ServerLoop::new(
            listener,
            move |stream: TcpStream, _: SocketAddr| {
                let token = handler_token.clone();
                async move {
                    stream.write_all(b"bye").await.unwrap();
                    token.stop_serving();
                }
            },
            Dispatch::Bare,
        )
        .unwrap()
        .with_stop_token(token.clone());

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        });

        let server = Rc::new(server);
        let driven = Rc::clone(&server);
        let result = handle
            .block_on(async move { driven.start().await })
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(token.is_stopped());
        assert_eq!(client.join().unwrap(), b"bye");

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(logs_contain("stop requested"));
        assert!(!logs_contain("closing"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.ends_with(": stopped")).count() {
                1 => Ok(()),
                n => Err(format!("expected one \"stopped\" line, got {n}")),
            }
        });
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (listener, _) = bound();
        let server = ServerLoop::new(listener, |_: TcpStream, _: SocketAddr| async {}, Dispatch::Bare)
            .unwrap();
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.stop_token().is_stopped());
    }

    #[test]
    fn test_stopping_one_server_leaves_shared_token_alone() {
        let token = StopServe::new();
        let (first, _) = bound();
        let (second, _) = bound();
        let first = ServerLoop::new(first, |_: TcpStream, _: SocketAddr| async {}, Dispatch::Bare)
            .unwrap()
            .with_stop_token(token.clone());
        let second = ServerLoop::new(second, |_: TcpStream, _: SocketAddr| async {}, Dispatch::Bare)
            .unwrap()
            .with_stop_token(token.clone());

        first.stop();
        assert_eq!(first.state(), ServerState::Stopped);
        assert_eq!(second.state(), ServerState::Created);
        assert!(!token.is_stopped());
    }

    #[test]
    fn test_long_running_server_keeps_one_waker_per_race() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let (listener, addr) = bound();
        let server = ServerLoop::new(
            listener,
            |stream: TcpStream, _: SocketAddr| async move {
                let _ = stream.write_all(b"k").await;
            },
            Dispatch::Pool(GreenPool::new(4), PoolSpawn::SpawnN),
        )
        .unwrap();
        let token = server.stop_token();

        let client_token = token.clone();
        let client = thread::spawn(move || {
            let mut most = 0;
            for _ in 0..50 {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).unwrap();
                most = most.max(client_token.inner.wakers().len());
            }
            client_token.stop_serving();
            most
        });

        handle
            .block_on(async move { server.start().await })
            .unwrap()
            .unwrap();
        assert!(client.join().unwrap() <= 1);
        assert!(token.inner.wakers().is_empty());
    }

    #[test]
    fn test_restart_after_stop() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let (listener, addr) = bound();
        let server = Rc::new(
            ServerLoop::new(
                listener,
                |stream: TcpStream, _: SocketAddr| async move {
                    let _ = stream.write_all(b"x").await;
                },
                Dispatch::Bare,
            )
            .unwrap(),
        );
        server.stop();

        let token = server.stop_token();
        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            token.stop_serving();
            byte
        });

        let driven = Rc::clone(&server);
        handle
            .block_on(async move { driven.start().await })
            .unwrap()
            .unwrap();
        assert_eq!(&client.join().unwrap(), b"x");
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_bare_dispatch_runs_handler_before_next_accept() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let (listener, addr) = bound();
        let seen = Rc::new(Cell::new(0));

        let handler_seen = Rc::clone(&seen);
        let server = ServerLoop::new(
            listener,
            move |stream: TcpStream, _: SocketAddr| {
                handler_seen.set(handler_seen.get() + 1);
                async move {
                    let mut buf = [0u8; 8];
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write_all(&buf[..n]).await.unwrap();
                }
            },
            Dispatch::Bare,
        )
        .unwrap();
        let token = server.stop_token();

        let client = thread::spawn(move || {
            let mut replies = Vec::new();
            for msg in [b"one", b"two"] {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                stream.write_all(msg).unwrap();
                let mut buf = [0u8; 3];
                stream.read_exact(&mut buf).unwrap();
                replies.push(buf.to_vec());
            }
            token.stop_serving();
            replies
        });

        handle
            .block_on(async move { server.start().await })
            .unwrap()
            .unwrap();
        assert_eq!(client.join().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn test_stop_serving_before_start_skips_accepting() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let (listener, _) = bound();
        let token = StopServe::new();
        token.stop_serving();

        let result = handle
            .block_on(serve_with_token(
                listener,
                |_: TcpStream, _: SocketAddr| async {},
                DEFAULT_CONCURRENCY,
                token,
            ))
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.hub().listener_count(), 0);
    }
}
