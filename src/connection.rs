use std::any::Any;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// Default output-queue backpressure threshold: 64 MiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Shared handle to a connection; the loop, the owning facade and in-flight
/// closures all hold one, and the connection stays alive until the last of
/// them completes.
pub type TcpConn = Arc<TcpConnection>;

/// Fires on both the "up" and the "down" transition; callers distinguish by
/// querying [`TcpConnection::is_connected`] inside the callback.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Receives the input buffer and the poll return time; whatever the callback
/// does not retrieve stays buffered for the next read event.
pub type MessageCallback = Arc<dyn Fn(&TcpConn, &mut Buffer, Timestamp) + Send + Sync>;

pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Receives the queued byte count; fires once per below→above crossing of
/// the high-water mark, and is the engine's only backpressure signal.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConn, usize) + Send + Sync>;

/// Installed by whichever facade created the connection; expected to schedule
/// [`TcpConnection::connect_destroyed`] on the loop, deferred.
pub type CloseCallback = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Connection lifecycle; `Disconnected` is terminal.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Buffered, backpressure-aware, half-close-capable TCP session.
///
/// A connection is created around an already established (or about to be
/// established) socket — never around a listening one. The state field is
/// atomic because `send`/`shutdown` snapshot it from foreign threads; every
/// other field is only touched on the owning loop's thread, marshaled there
/// by the public entry points.
pub struct TcpConnection {
    owner: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: TcpStream,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub fn new(
        owner: Arc<EventLoop>,
        name: String,
        socket: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConn {
        if let Err(err) = socket.set_nonblocking(true) {
            log::error!(target: "conn", "{name}: cannot make socket non-blocking: {err}");
        }
        if let Err(err) = socket2::SockRef::from(&socket).set_keepalive(true) {
            log::warn!(target: "conn", "{name}: cannot enable keepalive: {err}");
        }
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(&owner, socket.as_raw_fd());
            let w = weak.clone();
            channel.set_read_callback(move |at| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(at);
                }
            });
            let w = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });
            TcpConnection {
                owner,
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                socket,
                channel,
                local_addr,
                peer_addr,
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
                context: Mutex::new(None),
            }
        });
        log::debug!(target: "conn", "{}: created for fd {}", conn.name, conn.channel.fd());
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Attaches an opaque user context to the connection.
    pub fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.lock().unwrap().clone()
    }

    /// Queued output not yet accepted by the kernel.
    pub fn queued_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }

    /// Sends `data`, from any thread.
    ///
    /// A silent no-op unless the connection is Connected — data is dropped,
    /// never queued after a shutdown has been requested. On the loop thread a
    /// direct non-blocking write is attempted first when nothing is queued;
    /// the remainder goes to the output buffer under write interest.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.owner.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-closes the write side once the pending output drains; reading
    /// continues. Valid only from Connected.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.owner.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Tears the connection down regardless of queued output.
    ///
    /// Always deferred one tick through the functor queue so an in-flight
    /// event for this channel on the current iteration never observes the
    /// teardown mid-dispatch.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.owner.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Arms the read side and announces the connection; called once by the
    /// creating facade, on the loop thread.
    pub fn connect_established(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Final teardown; unregisters the channel. When the close path did not
    /// run (the facade is dropping a live connection) this also flips the
    /// state and delivers the "down" notification.
    pub fn connect_destroyed(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            log::warn!(target: "conn", "{}: disconnected, dropping {} bytes", self.name, data.len());
            return;
        }
        let mut output = self.output.lock().unwrap();
        let mut wrote = 0usize;
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match (&self.socket).write(data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.clone();
                            self.owner.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    // fault-class errors (broken pipe, reset) are log-only
                    // here; the remainder still queues so ordering holds, and
                    // the close path tears the session down
                    log::error!(target: "conn", "{}: write failed: {err}", self.name);
                }
            }
        }
        let remaining = data.len() - wrote;
        if remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < mark && old_len + remaining >= mark {
                if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.owner.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        debug_assert!(self.owner.is_in_loop_thread());
        // write interest still on means the output buffer has not drained
        // yet; the writable handler completes the half-close then
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown(Shutdown::Write) {
                log::error!(target: "conn", "{}: shutdown failed: {err}", self.name);
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.handle_close();
        }
    }

    fn handle_read(self: &Arc<Self>, at: Timestamp) {
        let mut input = self.input.lock().unwrap();
        match input.read_fd(&self.socket) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(cb) = self.message_cb.lock().unwrap().clone() {
                    cb(self, &mut input, at);
                } else {
                    // nobody is reading; unconsumed input must not pile up
                    input.retrieve_all();
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::warn!(target: "conn", "{}: read readiness without data", self.name);
            }
            Err(err) => {
                drop(input);
                log::error!(target: "conn", "{}: read failed: {err}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            log::trace!(target: "conn", "{}: write readiness with interest off", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match (&self.socket).write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        let conn = self.clone();
                        self.owner.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::Interrupted]
                    .contains(&err.kind()) => {}
            Err(err) => {
                log::error!(target: "conn", "{}: drain failed: {err}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        log::trace!(target: "conn", "{}: closing in state {:?}", self.name, self.state());
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => {
                log::error!(target: "conn", "{}: SO_ERROR = {err}", self.name)
            }
            Ok(None) => {
                log::error!(target: "conn", "{}: error event without SO_ERROR", self.name)
            }
            Err(err) => {
                log::error!(target: "conn", "{}: cannot read SO_ERROR: {err}", self.name)
            }
        }
    }
}
