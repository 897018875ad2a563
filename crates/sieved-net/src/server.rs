use std::{
    io,
    mem,
    os::fd::{AsRawFd, FromRawFd, RawFd},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener, net::UdpSocket, unix::SourceFd};
use tracing::{debug, error, warn};

use crate::{
    channel::{Reactor, Side, WakeEvent},
    config::NetConfig,
    conn::{Conn, ConnTable, FillOutcome},
    error::NetError,
    safe_panic,
};

/// Listen backlog for the TCP listener.
const BACKLOG_SIZE: libc::c_int = 64;

/// Client tokens are the fd number itself; the fixed infrastructure tokens
/// sit at the top of the token space where no fd can reach.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const TCP_LISTENER_TOKEN: Token = Token(usize::MAX - 2);
const UDP_LISTENER_TOKEN: Token = Token(usize::MAX - 3);

/// The command layer's side of the bargain: called once per readable burst
/// with the connection as both frame source and reply sink.
///
/// Implementations consume complete frames with [`Conn::scan_to`] (leaving
/// partial trailing input buffered for the next burst) and reply through
/// [`Conn::send`]. Frame slices must not outlive the `scan_to` call.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, conn: &Arc<Conn>);
}

/// The demultiplexer and its one-event buffer. Whoever holds the leader
/// mutex holds these.
struct LoopState {
    poll: Poll,
    events: Events,
}

/// The networking context: listeners, the shared event loop, the worker
/// pool glue and the connection table.
pub struct Networking {
    config: NetConfig,
    handler: Arc<dyn CommandHandler>,
    /// Serialises demultiplexer entry; owning the guard is being the leader.
    leader: Mutex<LoopState>,
    reactor: Arc<Reactor>,
    tcp_listener: spin::Mutex<Option<TcpListener>>,
    tcp_fd: RawFd,
    udp_socket: spin::Mutex<Option<UdpSocket>>,
    udp_fd: RawFd,
    conns: ConnTable,
    should_run: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// One ready watcher, pulled out of the demultiplexer and stopped, owned by
/// the worker that claimed it.
struct Claimed {
    token: Token,
    readable: bool,
    writable: bool,
    conn: Option<Arc<Conn>>,
}

impl Networking {
    /// Binds the TCP and UDP listeners on all interfaces and sets up the
    /// shared event loop. Workers still have to be started, either with
    /// [`Networking::spawn_workers`] or by calling
    /// [`Networking::start_worker`] from threads the host owns.
    pub fn init(
        config: NetConfig,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Arc<Self>, NetError> {
        let poll = Poll::new().map_err(NetError::PollInit)?;
        let registry = poll.registry().try_clone().map_err(NetError::PollInit)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(NetError::PollInit)?;

        let tcp_listener = bind_tcp_listener(config.tcp_port)?;
        let tcp_fd = tcp_listener.as_raw_fd();
        let udp_socket = bind_udp_socket(config.udp_port)?;
        let udp_fd = udp_socket.as_raw_fd();

        registry
            .register(&mut SourceFd(&tcp_fd), TCP_LISTENER_TOKEN, Interest::READABLE)
            .map_err(NetError::PollInit)?;
        registry
            .register(&mut SourceFd(&udp_fd), UDP_LISTENER_TOKEN, Interest::READABLE)
            .map_err(NetError::PollInit)?;

        Ok(Arc::new(Self {
            config,
            handler,
            leader: Mutex::new(LoopState { poll, events: Events::with_capacity(1) }),
            reactor: Arc::new(Reactor::new(registry, waker)),
            tcp_listener: spin::Mutex::new(Some(tcp_listener)),
            tcp_fd,
            udp_socket: spin::Mutex::new(Some(udp_socket)),
            udp_fd,
            conns: ConnTable::new(),
            should_run: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns `config.worker_threads` workers that run
    /// [`Networking::start_worker`]. Their handles are joined by
    /// [`Networking::shutdown`].
    pub fn spawn_workers(self: &Arc<Self>) -> Result<(), NetError> {
        let mut workers = self.workers.lock().expect("worker table mutex poisoned");
        for i in 0..self.config.worker_threads {
            let ctx = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("sieved-net-worker-{i}"))
                .spawn(move || ctx.start_worker())
                .map_err(NetError::SpawnWorker)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Joins the leader/followers rotation and blocks until shutdown.
    ///
    /// Exactly one worker at a time blocks inside the demultiplexer; it
    /// claims at most one ready watcher, hands leadership over, and only
    /// then dispatches the watcher it claimed.
    pub fn start_worker(&self) {
        loop {
            let claimed = {
                let mut leader = self.leader.lock().expect("leader mutex poisoned");
                if !self.should_run.load(Ordering::Acquire) {
                    break;
                }
                self.poll_one(&mut leader)
            };
            if let Some(claimed) = claimed {
                self.dispatch(claimed);
            }
        }
    }

    /// One blocking demultiplexer turn. Runs with the leader mutex held;
    /// the returned watcher is already stopped.
    fn poll_one(&self, leader: &mut LoopState) -> Option<Claimed> {
        if let Err(err) = leader.poll.poll(&mut leader.events, None) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!(%err, "event loop poll failed");
            }
            return None;
        }
        let event = leader.events.iter().next()?;
        let token = event.token();
        let readable = event.is_readable();
        let writable = event.is_writable();

        let conn = match token {
            WAKER_TOKEN => None,
            TCP_LISTENER_TOKEN => {
                self.stop_listener(self.tcp_fd);
                None
            }
            UDP_LISTENER_TOKEN => {
                self.stop_listener(self.udp_fd);
                None
            }
            Token(fd) => {
                let conn = self.conns.get(fd as RawFd);
                match &conn {
                    Some(conn) => conn.claim(readable, writable),
                    None => safe_panic!("got event for unknown fd {fd}"),
                }
                conn
            }
        };
        Some(Claimed { token, readable, writable, conn })
    }

    fn stop_listener(&self, fd: RawFd) {
        if let Err(err) = self.reactor.registry.deregister(&mut SourceFd(&fd)) {
            debug!(fd, %err, "couldn't stop listener watcher");
        }
    }

    /// Handles one claimed watcher, outside the leader mutex.
    fn dispatch(&self, claimed: Claimed) {
        match claimed.token {
            WAKER_TOKEN => self.drain_wake_events(),
            TCP_LISTENER_TOKEN => self.accept_client(),
            UDP_LISTENER_TOKEN => self.reject_udp_datagram(),
            _ => {
                let Some(conn) = claimed.conn else {
                    return;
                };
                if claimed.writable {
                    conn.drain_output();
                }
                if claimed.readable {
                    self.handle_readable(&conn);
                }
            }
        }
    }

    /// Applies everything queued on the wake channel since the last drain.
    fn drain_wake_events(&self) {
        let mut pending = self.reactor.take_pending();
        while let Some(event) = pending.pop() {
            match event {
                WakeEvent::Exit => {
                    self.should_run.store(false, Ordering::Release);
                    // Kick whichever worker is blocked in the demultiplexer
                    // so it notices the flag.
                    self.reactor.wake();
                }
                WakeEvent::Rearm { conn, side } => conn.arm(side),
                WakeEvent::RearmTcpListener => self.arm_tcp_listener(),
            }
        }
    }

    fn arm_tcp_listener(&self) {
        if !self.should_run.load(Ordering::Acquire) {
            return;
        }
        let mut src = SourceFd(&self.tcp_fd);
        let res = match self.reactor.registry.register(
            &mut src,
            TCP_LISTENER_TOKEN,
            Interest::READABLE,
        ) {
            Err(ref err) if err.kind() == io::ErrorKind::AlreadyExists => self
                .reactor
                .registry
                .reregister(&mut src, TCP_LISTENER_TOKEN, Interest::READABLE),
            other => other,
        };
        if let Err(err) = res {
            error!(%err, "couldn't rearm tcp listener");
        }
    }

    /// Listener fired: take one pending connection and wire it up.
    fn accept_client(&self) {
        let accepted = {
            let listener = self.tcp_listener.lock();
            match listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            }
        };
        match accepted {
            Ok((sock, addr)) => {
                debug!(%addr, "client connected");
                let fd = sock.as_raw_fd();
                if let Err(err) = sock.set_nodelay(true) {
                    warn!(%addr, %err, "couldn't set TCP_NODELAY");
                }
                set_keepalive(fd);
                let conn = self.conns.get_or_create(fd, &self.reactor);
                conn.open(sock);
                self.reactor.post(WakeEvent::Rearm { conn, side: Side::Read });
            }
            Err(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => error!(%err, "accept failed"),
        }
        // The listener is one-shot like every other watcher.
        self.reactor.post(WakeEvent::RearmTcpListener);
    }

    /// UDP is bound but not served. Drain the datagram so the socket does
    /// not sit hot, say so, and leave the watcher stopped.
    fn reject_udp_datagram(&self) {
        let udp = self.udp_socket.lock();
        let Some(socket) = udp.as_ref() else {
            return;
        };
        let mut scratch = [0u8; 2048];
        match socket.recv_from(&mut scratch) {
            Ok((len, addr)) => {
                warn!(%addr, len, "udp commands are not supported, dropping datagram");
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(%err, "udp recv failed"),
        }
    }

    /// Readable client: fill the input ring, hand complete frames to the
    /// command layer, then queue the read watcher for re-arming.
    fn handle_readable(&self, conn: &Arc<Conn>) {
        match conn.fill_input() {
            FillOutcome::Closed => {
                conn.close();
                return;
            }
            FillOutcome::Transient => {}
            FillOutcome::Bytes(_) => self.handler.handle(conn),
        }
        // The handler may have force-closed the connection.
        if conn.should_schedule() {
            self.reactor
                .post(WakeEvent::Rearm { conn: Arc::clone(conn), side: Side::Read });
        }
    }

    /// Stops the workers, closes the listeners and every client socket, and
    /// joins the threads spawned by [`Networking::spawn_workers`]. Safe to
    /// call more than once, but not from a worker thread.
    pub fn shutdown(&self) {
        if self.should_run.swap(false, Ordering::AcqRel) {
            self.reactor.post(WakeEvent::Exit);
        }
        let workers = mem::take(&mut *self.workers.lock().expect("worker table mutex poisoned"));
        for worker in workers {
            let _ = worker.join();
        }
        if let Some(listener) = self.tcp_listener.lock().take() {
            self.stop_listener(self.tcp_fd);
            drop(listener);
        }
        if let Some(socket) = self.udp_socket.lock().take() {
            self.stop_listener(self.udp_fd);
            drop(socket);
        }
        self.conns.shutdown();
        debug!("networking stack shut down");
    }
}

/// Best effort, the connection is usable without it.
fn set_keepalive(fd: RawFd) {
    let one: libc::c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res != 0 {
        warn!(fd, err = %io::Error::last_os_error(), "couldn't set SO_KEEPALIVE");
    }
}

/// Raw socket/bind/listen so the backlog and SO_REUSEADDR are ours to pick,
/// then handed to mio for readiness.
fn bind_tcp_listener(port: u16) -> Result<TcpListener, NetError> {
    let fd = new_inet_socket(libc::SOCK_STREAM, "tcp", port)?;
    if unsafe { libc::listen(fd, BACKLOG_SIZE) } != 0 {
        let source = io::Error::last_os_error();
        error!(port, %source, "failed to listen on TCP socket");
        unsafe { libc::close(fd) };
        return Err(NetError::Listen { port, source });
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn bind_udp_socket(port: u16) -> Result<UdpSocket, NetError> {
    let fd = new_inet_socket(libc::SOCK_DGRAM, "udp", port)?;
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

/// Non-blocking INADDR_ANY socket with SO_REUSEADDR, bound to `port`.
fn new_inet_socket(
    kind: libc::c_int,
    proto: &'static str,
    port: u16,
) -> Result<RawFd, NetError> {
    let bind_failure = |fd: RawFd| {
        let source = io::Error::last_os_error();
        error!(proto, port, %source, "failed to set up listener socket");
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        NetError::Bind { proto, port, source }
    };

    let fd = unsafe { libc::socket(libc::AF_INET, kind, 0) };
    if fd < 0 {
        return Err(bind_failure(fd));
    }
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(bind_failure(fd));
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY;
    let res = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if res != 0 {
        return Err(bind_failure(fd));
    }
    Ok(fd)
}
