use std::any::Any;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Receives a freshly established, non-blocking, writable socket; ownership
/// transfers to the callback.
pub type NewSocketCallback = Box<dyn FnMut(TcpStream) + Send>;

/// First retry delay after a transient connect failure.
pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry delays double up to this cap.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(value: u8) -> ConnectorState {
        match value {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// One in-flight connect attempt: the half-open socket and the channel
/// watching it for write readiness.
struct Attempt {
    socket: Socket,
    channel: Arc<Channel>,
}

/// Active-open with exponential-backoff retry.
///
/// A connector attempts exactly one logical connection per
/// [`Connector::start`]/[`Connector::restart`] cycle; the backoff delay
/// resets only on `restart`. At most one attempt is in flight at any time.
pub struct Connector {
    owner: Arc<EventLoop>,
    server_addr: SocketAddr,
    /// The "desired" flag: armed by `start`/`restart`, cleared by `stop`.
    armed: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    new_socket_cb: Mutex<Option<NewSocketCallback>>,
}

impl Connector {
    pub fn new(owner: Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new(Connector {
            owner,
            server_addr,
            armed: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            attempt: Mutex::new(None),
            new_socket_cb: Mutex::new(None),
        })
    }

    pub fn set_new_socket_callback(&self, cb: impl FnMut(TcpStream) + Send + 'static) {
        *self.new_socket_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current backoff delay for the next retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::Relaxed))
    }

    /// Arms the connector and initiates a non-blocking connect on the loop
    /// thread; safe from any thread.
    pub fn start(self: &Arc<Self>) {
        self.armed.store(true, Ordering::Release);
        let connector = self.clone();
        self.owner.run_in_loop(move || connector.start_in_loop());
    }

    /// Disarms the connector. An in-flight attempt is torn down and its
    /// half-open descriptor discarded without installing a connection; a
    /// retry already scheduled becomes a no-op.
    pub fn stop(self: &Arc<Self>) {
        self.armed.store(false, Ordering::Release);
        let connector = self.clone();
        self.owner.queue_in_loop(move || connector.stop_in_loop());
    }

    /// Back to the initial backoff delay and a fresh connect cycle; runs on
    /// the loop thread (facades call it from close handling).
    pub fn restart(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        self.set_state(ConnectorState::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        if self.armed.load(Ordering::Acquire) {
            self.connect();
        } else {
            log::debug!(target: "connect", "connector to {} is disarmed", self.server_addr);
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        if self.state() == ConnectorState::Connecting {
            self.set_state(ConnectorState::Disconnected);
            if let Some(socket) = self.take_attempt() {
                // disarmed, so this only discards the descriptor
                self.retry(socket);
            }
        }
    }

    /// Outcome classification of the connect syscall is the crux: immediate
    /// success and in-progress/interrupted register the socket for write
    /// readiness; transient errors schedule a retry; permanent errors
    /// abandon the attempt and close the descriptor.
    fn connect(self: &Arc<Self>) {
        let socket = Socket::new(
            Domain::for_address(self.server_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .and_then(|socket| {
            socket.set_nonblocking(true)?;
            Ok(socket)
        });
        let socket = match socket {
            Ok(socket) => socket,
            Err(err) => {
                log::error!(target: "connect", "cannot create socket for {}: {err}", self.server_addr);
                return;
            }
        };
        match socket.connect(&self.server_addr.into()) {
            Ok(()) => self.connecting(socket),
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => self.connecting(socket),
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH,
                ) => {
                    log::warn!(target: "connect", "transient error connecting to {}: {err}", self.server_addr);
                    self.retry(socket);
                }
                Some(
                    libc::EACCES
                    | libc::EPERM
                    | libc::EAFNOSUPPORT
                    | libc::EALREADY
                    | libc::EBADF
                    | libc::EFAULT
                    | libc::ENOTSOCK,
                ) => {
                    log::error!(target: "connect", "connect to {} failed: {err}", self.server_addr);
                }
                _ => {
                    log::error!(target: "connect", "unexpected error connecting to {}: {err}", self.server_addr);
                }
            },
        }
    }

    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(ConnectorState::Connecting);
        let channel = Channel::new(&self.owner, socket.as_raw_fd());
        let w = Arc::downgrade(self);
        channel.set_write_callback(move || {
            if let Some(connector) = w.upgrade() {
                connector.handle_write();
            }
        });
        let w = Arc::downgrade(self);
        channel.set_error_callback(move || {
            if let Some(connector) = w.upgrade() {
                connector.handle_error();
            }
        });
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        channel.tie(&tie);
        channel.enable_writing();
        *self.attempt.lock().unwrap() = Some(Attempt { socket, channel });
    }

    /// Unregisters the in-flight channel and hands back the socket. The
    /// channel may be mid-dispatch on this very iteration, so its release is
    /// deferred one tick.
    fn take_attempt(&self) -> Option<Socket> {
        let attempt = self.attempt.lock().unwrap().take();
        attempt.map(|Attempt { socket, channel }| {
            channel.disable_all();
            channel.remove();
            self.owner.queue_in_loop(move || drop(channel));
            socket
        })
    }

    /// Write readiness while Connecting reveals the connect outcome:
    /// `SO_ERROR` or a detected self-connect routes to retry, otherwise the
    /// socket is handed to the new-connection callback.
    fn handle_write(self: &Arc<Self>) {
        log::trace!(target: "connect", "connector to {} writable in state {:?}", self.server_addr, self.state());
        if self.state() != ConnectorState::Connecting {
            return;
        }
        let socket = match self.take_attempt() {
            Some(socket) => socket,
            None => return,
        };
        match socket.take_error() {
            Ok(Some(err)) => {
                log::warn!(target: "connect", "SO_ERROR connecting to {}: {err}", self.server_addr);
                self.retry(socket);
            }
            Err(err) => {
                log::error!(target: "connect", "cannot read SO_ERROR for {}: {err}", self.server_addr);
                self.retry(socket);
            }
            Ok(None) => {
                if is_self_connect(&socket) {
                    log::warn!(target: "connect", "self-connect detected for {}", self.server_addr);
                    self.retry(socket);
                    return;
                }
                self.set_state(ConnectorState::Connected);
                if self.armed.load(Ordering::Acquire) {
                    let stream = TcpStream::from(socket);
                    if let Some(cb) = self.new_socket_cb.lock().unwrap().as_mut() {
                        cb(stream);
                    }
                } else {
                    // stopped while the probe was in flight; discard
                    drop(socket);
                }
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        log::error!(target: "connect", "error event in state {:?}", self.state());
        if self.state() == ConnectorState::Connecting {
            if let Some(socket) = self.take_attempt() {
                if let Ok(Some(err)) = socket.take_error() {
                    log::trace!(target: "connect", "SO_ERROR = {err}");
                }
                self.retry(socket);
            }
        }
    }

    /// Closes the failed descriptor and, while armed, schedules the next
    /// attempt after the current backoff delay, doubling it up to the cap.
    /// The timer closure keeps a strong reference so the connector outlives
    /// the deferred retry.
    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(ConnectorState::Disconnected);
        if self.armed.load(Ordering::Acquire) {
            let delay = self.retry_delay();
            log::info!(target: "connect", "retrying {} in {delay:?}", self.server_addr);
            let connector = self.clone();
            self.owner.run_after(delay, move || connector.start_in_loop());
            let next = (delay * 2).min(MAX_RETRY_DELAY);
            self.retry_delay_ms
                .store(next.as_millis() as u64, Ordering::Relaxed);
        } else {
            log::debug!(target: "connect", "connector to {} is disarmed", self.server_addr);
        }
    }
}

/// A non-blocking connect can spuriously succeed by connecting the socket to
/// itself on loopback; local endpoint equal to remote endpoint reveals it.
fn is_self_connect(socket: &Socket) -> bool {
    match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => {
            local.as_socket().is_some() && local.as_socket() == peer.as_socket()
        }
        _ => false,
    }
}
