//! Non-blocking TCP built on the hub.
//!
//! Every blocking operation tries the syscall first and, on `WouldBlock`,
//! suspends the fiber on a hub listener for the socket until it is ready.

pub mod tcp;

pub use tcp::{DEFAULT_BACKLOG, TcpListener, TcpStream, listen};
