use std::sync::Arc;

use mio::{Registry, Waker};

use crate::{conn::Conn, safe_panic};

/// Which half of a connection's interest a re-arm applies to.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Side {
    Read,
    Write,
}

/// Work for the event loop that must not touch the demultiplexer from the
/// posting thread directly.
pub(crate) enum WakeEvent {
    /// Stop the worker loops.
    Exit,
    /// Put one side of a connection's interest back into the demultiplexer.
    Rearm { conn: Arc<Conn>, side: Side },
    /// Put the TCP listener back into the demultiplexer.
    RearmTcpListener,
}

/// The loop-facing half every connection holds on to: the registration
/// surface of the shared poll plus the wake-up channel into it.
///
/// `post` may be called from any thread. Every post signals the waker, and
/// the kernel coalesces signals, so a drain observes everything posted
/// before its wake-up and later posts are guaranteed a wake-up of their own.
pub(crate) struct Reactor {
    pub(crate) registry: Registry,
    waker: Waker,
    pending: spin::Mutex<Vec<WakeEvent>>,
}

impl Reactor {
    pub(crate) fn new(registry: Registry, waker: Waker) -> Self {
        Self { registry, waker, pending: spin::Mutex::new(Vec::new()) }
    }

    pub(crate) fn post(&self, event: WakeEvent) {
        self.pending.lock().push(event);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            safe_panic!("couldn't wake the event loop: {err}");
        }
    }

    /// Detaches the pending list so the caller can apply it lock-free.
    pub(crate) fn take_pending(&self) -> Vec<WakeEvent> {
        std::mem::take(&mut *self.pending.lock())
    }
}
