use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Receives a freshly accepted, non-blocking, otherwise unowned socket and
/// the peer's address; ownership transfers to the callback.
pub type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

/// Passive-open listener.
///
/// Binds at construction (with `SO_REUSEADDR`, and `SO_REUSEPORT` when
/// requested) but listens only when explicitly told to. One connection is
/// accepted per readable event, keeping the reactor fair to other fds; the
/// level-triggered poller re-reports readiness while backlog remains.
pub struct Acceptor {
    owner: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    /// Reserved descriptor sacrificed on EMFILE so the readable event does
    /// not spin: close it, accept, drop the connection, reopen.
    idle_fd: Mutex<Option<File>>,
}

impl Acceptor {
    /// Fatal if the address cannot be bound; a mandatory socket failing on a
    /// supposedly free address has no degraded mode.
    pub fn new(owner: Arc<EventLoop>, listen_addr: SocketAddr, reuse_port: bool) -> Arc<Acceptor> {
        let socket = match bind_listener(listen_addr, reuse_port) {
            Ok(socket) => socket,
            Err(err) => {
                log::error!(target: "accept", "cannot bind {listen_addr}: {err}");
                panic!("cannot bind {listen_addr}: {err}");
            }
        };
        let idle_fd = File::open("/dev/null").ok();
        Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let channel = Channel::new(&owner, socket.as_raw_fd());
            let w = weak.clone();
            channel.set_read_callback(move |_| {
                if let Some(acceptor) = w.upgrade() {
                    acceptor.handle_read();
                }
            });
            Acceptor {
                owner,
                socket,
                channel,
                listening: AtomicBool::new(false),
                new_connection_cb: Mutex::new(None),
                idle_fd: Mutex::new(idle_fd),
            }
        })
    }

    pub fn set_new_connection_callback(
        &self,
        cb: impl FnMut(TcpStream, SocketAddr) + Send + 'static,
    ) {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Actual bound address; resolves a port-0 bind.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .expect("bound listener knows its local address")
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts listening and arms read interest; runs on the owning loop's
    /// thread. Fatal on failure.
    pub fn listen(self: &Arc<Self>) {
        debug_assert!(self.owner.is_in_loop_thread());
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.socket.listen(libc::SOMAXCONN) {
            let addr = self.local_addr();
            log::error!(target: "accept", "cannot listen on {addr}: {err}");
            panic!("cannot listen on {addr}: {err}");
        }
        self.channel.enable_reading();
        log::info!(target: "accept", "listening on {}", self.local_addr());
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((socket, addr)) => {
                let peer = match addr.as_socket() {
                    Some(peer) => peer,
                    None => {
                        log::error!(target: "accept", "accepted a non-inet peer, dropping");
                        return;
                    }
                };
                if let Err(err) = socket.set_nonblocking(true) {
                    log::error!(target: "accept", "cannot make accepted socket non-blocking: {err}");
                }
                log::trace!(target: "accept", "accepted connection from {peer}");
                let stream = TcpStream::from(socket);
                match self.new_connection_cb.lock().unwrap().as_mut() {
                    Some(cb) => cb(stream, peer),
                    // nobody owns the fd yet, so dropping it here closes it
                    None => drop(stream),
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                log::error!(target: "accept", "file descriptors exhausted, shedding one connection");
                let mut idle = self.idle_fd.lock().unwrap();
                idle.take();
                let _ = self.socket.accept();
                *idle = File::open("/dev/null").ok();
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::error!(target: "accept", "accept failed: {err}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.channel.clone();
        self.owner.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
        });
    }
}

fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}
