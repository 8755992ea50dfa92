//! A single-threaded cooperative I/O hub.
//!
//! Every OS thread owns one [`Hub`]: a reactor over a native event loop that
//! multiplexes fd readiness, timers and callbacks scheduled for the next loop
//! iteration. Fibers are futures driven by the hub. The [`server`] module
//! builds a small TCP accept-and-dispatch harness on top.
pub mod engine;
pub mod error;
pub mod executor;
pub mod hub;
pub mod net;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod spawner;
pub mod sync;
pub mod time;

mod task;

pub use greenhub_macro::main;

pub use error::{EngineError, HubError, ServerError};
pub use hub::{Hub, HubConfig, get_hub};
pub use net::{TcpListener, TcpStream, listen};
pub use pool::GreenPool;
pub use server::{
    DEFAULT_CONCURRENCY, Dispatch, PoolSpawn, Server, ServerLoop, ServerState, StopServe, serve,
    serve_with_token,
};
pub use spawner::{JoinError, JoinHandle, spawn, spawn_n, spawn_now, yield_now};
