use std::{
    io::{self, IoSlice, Read, Write},
    os::fd::RawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Interest, Token, unix::SourceFd};
use tracing::{debug, error};

use crate::{
    buffer::CircBuf,
    channel::{Reactor, Side, WakeEvent},
};

/// How big the connection table starts, in slots. File descriptors index it
/// directly, so for most deployments this never grows.
const INIT_CONN_LIST_SIZE: usize = 1024;

/// State of one client socket. A record is created on the first accept for
/// its fd and then lives until shutdown: closing the connection drops the
/// socket and resets the buffers, but the slot keeps the record so a future
/// accept on the same fd number reuses it, allocations included.
pub struct Conn {
    fd: RawFd,
    /// Present while the connection is live. Dropping it closes the fd.
    sock: spin::Mutex<Option<mio::net::TcpStream>>,
    input: spin::Mutex<CircBuf>,
    /// Spooled output, only populated once a direct write left residue.
    /// Guards `use_write_buf` transitions as well.
    output: spin::Mutex<CircBuf>,
    /// Optimistic fast-path switch for `send`. 0->1 only when a direct write
    /// left residue, 1->0 only when the spool has just fully drained; both
    /// transitions happen under the `output` lock.
    use_write_buf: AtomicBool,
    /// Cleared on close; a record with this unset never re-enters the
    /// demultiplexer.
    should_schedule: AtomicBool,
    /// Which interest halves are currently registered for this fd.
    armed: spin::Mutex<Option<Interest>>,
    reactor: Arc<Reactor>,
}

pub(crate) enum FillOutcome {
    /// Fresh bytes landed in the input ring.
    Bytes(usize),
    /// Nothing to do, keep the connection.
    Transient,
    /// Peer gone or hard error, tear the connection down.
    Closed,
}

enum DrainOutcome {
    Done,
    More,
    Dead,
}

fn transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

impl Conn {
    fn new(fd: RawFd, reactor: Arc<Reactor>) -> Self {
        Self {
            fd,
            sock: spin::Mutex::new(None),
            input: spin::Mutex::new(CircBuf::new()),
            output: spin::Mutex::new(CircBuf::new()),
            use_write_buf: AtomicBool::new(false),
            should_schedule: AtomicBool::new(false),
            armed: spin::Mutex::new(None),
            reactor,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    fn token(&self) -> Token {
        Token(self.fd as usize)
    }

    #[inline]
    pub(crate) fn should_schedule(&self) -> bool {
        self.should_schedule.load(Ordering::Acquire)
    }

    /// Binds a freshly accepted socket to this record. Cursors restart at 0;
    /// the backing regions are reused when a previous tenant left them at
    /// the initial size.
    pub(crate) fn open(&self, sock: mio::net::TcpStream) {
        *self.sock.lock() = Some(sock);
        self.input.lock().reset();
        self.output.lock().reset();
        self.use_write_buf.store(false, Ordering::Release);
        self.should_schedule.store(true, Ordering::Release);
    }

    /// Extracts the next `term`-delimited frame from the input ring, if one
    /// is complete, and hands it to `f`. Contiguous frames arrive in place,
    /// wrapped frames as a stitched copy; either way the bytes are only
    /// valid for the duration of the call. Replying through [`Conn::send`]
    /// from inside `f` is fine.
    pub fn scan_to<R>(&self, term: u8, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.input.lock().scan_to(term, f)
    }

    /// Writes `bufs` out, in order, as one logical reply.
    ///
    /// Fast path is a single writev straight to the socket. Whatever the
    /// kernel refuses is spooled to the output ring and pushed out by the
    /// writable watcher, so a successful return means the bytes will reach
    /// the socket in order unless the connection dies first.
    pub fn send(self: &Arc<Self>, bufs: &[&[u8]]) -> io::Result<()> {
        if self.use_write_buf.load(Ordering::Acquire) {
            let mut output = self.output.lock();
            // May have drained and cleared while we took the lock.
            if self.use_write_buf.load(Ordering::Relaxed) {
                for buf in bufs {
                    output.append(buf);
                }
                return Ok(());
            }
        }
        self.send_direct(bufs)
    }

    fn send_direct(self: &Arc<Self>, bufs: &[&[u8]]) -> io::Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let res = {
            let sock = self.sock.lock();
            let Some(stream) = sock.as_ref() else {
                return Err(io::ErrorKind::NotConnected.into());
            };
            let iovs: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
            let mut writer: &mio::net::TcpStream = stream;
            writer.write_vectored(&iovs)
        };
        match res {
            Ok(sent) if sent == total => Ok(()),
            Ok(sent) => {
                self.spill_remainder(bufs, sent);
                Ok(())
            }
            Err(ref err) if transient(err) => {
                self.spill_remainder(bufs, 0);
                Ok(())
            }
            Err(err) => {
                error!(fd = self.fd, %err, "writev failed, closing connection");
                self.close();
                Err(err)
            }
        }
    }

    /// Queues everything the kernel did not take. `sent` bytes of `bufs`
    /// are already on the wire; the running sum finds the buffer the kernel
    /// stopped in and the offset inside it.
    fn spill_remainder(self: &Arc<Self>, bufs: &[&[u8]], sent: usize) {
        {
            let mut output = self.output.lock();
            let mut skipped = 0;
            for buf in bufs {
                let end = skipped + buf.len();
                if end > sent {
                    let offset = sent.saturating_sub(skipped);
                    output.append(&buf[offset..]);
                }
                skipped = end;
            }
            self.use_write_buf.store(true, Ordering::Release);
        }
        self.reactor.post(WakeEvent::Rearm { conn: Arc::clone(self), side: Side::Write });
    }

    /// Writable watcher fired: push spooled bytes out until the kernel
    /// blocks or the ring empties.
    pub(crate) fn drain_output(self: &Arc<Self>) {
        let outcome = {
            let mut output = self.output.lock();
            let sock = self.sock.lock();
            let Some(stream) = sock.as_ref() else {
                return;
            };
            if output.is_empty() {
                self.use_write_buf.store(false, Ordering::Release);
                return;
            }
            let (iovs, n) = output.write_iovecs();
            let mut writer: &mio::net::TcpStream = stream;
            match writer.write_vectored(&iovs[..n]) {
                Ok(0) => DrainOutcome::Dead,
                Ok(sent) => {
                    output.advance_read(sent);
                    if output.is_empty() {
                        self.use_write_buf.store(false, Ordering::Release);
                        DrainOutcome::Done
                    } else {
                        DrainOutcome::More
                    }
                }
                Err(ref err) if transient(err) => DrainOutcome::More,
                Err(err) => {
                    error!(fd = self.fd, %err, "writev failed while draining spool");
                    DrainOutcome::Dead
                }
            }
        };
        match outcome {
            DrainOutcome::Done => {}
            DrainOutcome::More => {
                self.reactor.post(WakeEvent::Rearm { conn: Arc::clone(self), side: Side::Write });
            }
            DrainOutcome::Dead => self.close(),
        }
    }

    /// Readable watcher fired: one readv into the input ring.
    pub(crate) fn fill_input(&self) -> FillOutcome {
        let sock = self.sock.lock();
        let Some(stream) = sock.as_ref() else {
            return FillOutcome::Transient;
        };
        let mut input = self.input.lock();
        // Keep at least half the ring writable so large commands land in
        // few reads.
        if input.available() < input.capacity() / 2 {
            input.grow();
        }
        let (mut iovs, n) = input.read_iovecs();
        let mut reader: &mio::net::TcpStream = stream;
        match reader.read_vectored(&mut iovs[..n]) {
            Ok(0) => {
                debug!(fd = self.fd, "peer closed connection");
                FillOutcome::Closed
            }
            Ok(read) => {
                input.advance_write(read);
                FillOutcome::Bytes(read)
            }
            Err(ref err) if transient(err) => FillOutcome::Transient,
            Err(err) => {
                error!(fd = self.fd, %err, "readv failed, closing connection");
                FillOutcome::Closed
            }
        }
    }

    /// Registers `side` with the demultiplexer again. Only ever entered via
    /// a drained wake event, which keeps a claimed watcher from being
    /// re-armed behind the handling worker's back.
    pub(crate) fn arm(&self, side: Side) {
        if !self.should_schedule() {
            return;
        }
        let mut armed = self.armed.lock();
        let interest = match side {
            Side::Read => Interest::READABLE,
            Side::Write => Interest::WRITABLE,
        };
        let combined = match *armed {
            Some(current) => current.add(interest),
            None => interest,
        };
        let mut src = SourceFd(&self.fd);
        let res = if armed.is_some() {
            self.reactor.registry.reregister(&mut src, self.token(), combined)
        } else {
            match self.reactor.registry.register(&mut src, self.token(), combined) {
                // A stale registration can survive a close/reopen race.
                Err(ref err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    self.reactor.registry.reregister(&mut src, self.token(), combined)
                }
                other => other,
            }
        };
        match res {
            Ok(()) => *armed = Some(combined),
            Err(err) => error!(fd = self.fd, %err, "couldn't arm watcher"),
        }
    }

    /// Takes the fired halves out of the registration before leadership is
    /// handed over, turning the readiness into a token owned by the calling
    /// worker.
    pub(crate) fn claim(&self, readable: bool, writable: bool) {
        let mut armed = self.armed.lock();
        let Some(current) = *armed else {
            return;
        };
        let mut remaining = Some(current);
        if readable {
            remaining = remaining.and_then(|i| i.remove(Interest::READABLE));
        }
        if writable {
            remaining = remaining.and_then(|i| i.remove(Interest::WRITABLE));
        }
        if remaining == Some(current) {
            return;
        }
        let mut src = SourceFd(&self.fd);
        let res = match remaining {
            Some(interest) => self.reactor.registry.reregister(&mut src, self.token(), interest),
            None => self.reactor.registry.deregister(&mut src),
        };
        if let Err(err) = res {
            debug!(fd = self.fd, %err, "couldn't downgrade watcher registration");
        }
        *armed = remaining;
    }

    /// Force-closes the connection: both watcher halves stopped, buffers
    /// back to their initial size, socket dropped. The record stays in its
    /// slot for the next accept on this fd. Safe to call more than once.
    pub fn close(&self) {
        self.should_schedule.store(false, Ordering::Release);
        {
            let mut armed = self.armed.lock();
            if armed.take().is_some() {
                let mut src = SourceFd(&self.fd);
                if let Err(err) = self.reactor.registry.deregister(&mut src) {
                    debug!(fd = self.fd, %err, "couldn't deregister on close");
                }
            }
        }
        let sock = self.sock.lock().take();
        if sock.is_some() {
            debug!(fd = self.fd, "connection torn down");
        }
        drop(sock);
        self.input.lock().reset();
        self.output.lock().reset();
        self.use_write_buf.store(false, Ordering::Release);
    }
}

/// Slot table of connection records, indexed by fd number.
pub(crate) struct ConnTable {
    slots: Mutex<Vec<Option<Arc<Conn>>>>,
}

impl ConnTable {
    pub(crate) fn new() -> Self {
        Self { slots: Mutex::new(vec![None; INIT_CONN_LIST_SIZE]) }
    }

    /// Fetches the record for `fd`, creating it on the first accept. The
    /// table doubles until the fd fits; existing slots carry over.
    pub(crate) fn get_or_create(&self, fd: RawFd, reactor: &Arc<Reactor>) -> Arc<Conn> {
        let mut slots = self.slots.lock().expect("conn table mutex poisoned");
        let idx = fd as usize;
        while slots.len() <= idx {
            let doubled = slots.len() * 2;
            slots.resize(doubled, None);
        }
        Arc::clone(
            slots[idx].get_or_insert_with(|| Arc::new(Conn::new(fd, Arc::clone(reactor)))),
        )
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        let slots = self.slots.lock().expect("conn table mutex poisoned");
        slots.get(fd as usize).and_then(Clone::clone)
    }

    /// Closes every live connection. Called once the workers have stopped.
    pub(crate) fn shutdown(&self) {
        let slots = self.slots.lock().expect("conn table mutex poisoned");
        for conn in slots.iter().flatten() {
            conn.close();
        }
    }
}
