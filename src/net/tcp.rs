mod listener;
mod stream;

pub use listener::{DEFAULT_BACKLOG, TcpListener, listen};
pub use stream::TcpStream;
