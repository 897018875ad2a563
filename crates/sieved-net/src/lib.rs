//! Network concurrency core of the sieved daemon.
//!
//! Clients hold long-lived TCP connections and issue newline-terminated
//! commands; this crate moves the bytes. A fixed pool of workers takes
//! turns owning one shared demultiplexer (leader/followers), each ready
//! watcher is claimed one-shot by the worker that saw it, and per-connection
//! circular buffers carry both directions with vectored IO. Replies go
//! straight to the socket when the kernel has room and spool to a locked
//! ring when it does not.
//!
//! The command parser and the filter manager live in the host daemon; they
//! plug in through [`CommandHandler`] and talk to a connection through
//! [`Conn::scan_to`] and [`Conn::send`].

mod buffer;
mod channel;
mod config;
mod conn;
mod error;
mod server;

pub use buffer::{CircBuf, INIT_BUF_SIZE};
pub use config::NetConfig;
pub use conn::Conn;
pub use error::NetError;
pub use server::{CommandHandler, Networking};

#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else {tracing::error!($($arg)*)})
}
