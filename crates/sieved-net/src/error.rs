use std::io;

use thiserror::Error;

/// Failures that abort [`Networking::init`](crate::Networking::init) or
/// worker spawning. Runtime socket errors never surface here; the loop
/// resolves those by tearing the affected connection down.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to bind {proto} listener on port {port}: {source}")]
    Bind { proto: &'static str, port: u16, source: io::Error },
    #[error("failed to listen on tcp port {port}: {source}")]
    Listen { port: u16, source: io::Error },
    #[error("event loop init failed: {0}")]
    PollInit(io::Error),
    #[error("couldn't spawn worker thread: {0}")]
    SpawnWorker(io::Error),
}
