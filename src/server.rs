use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConn, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::time::Timestamp;

/// Server facade: wires accepted sockets into named [`TcpConnection`]s and
/// distributes them round-robin over an event-loop pool.
///
/// The base loop runs the acceptor; with a non-zero thread count every
/// connection lives on a pool loop, otherwise on the base loop itself.
pub struct TcpServer {
    base: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    connections: Mutex<HashMap<String, TcpConn>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

impl TcpServer {
    /// Binds the listening socket (fatal on failure) without listening yet;
    /// `reuse_port` lets several servers on independent loops share the
    /// address.
    pub fn new(
        base: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl ToString,
        reuse_port: bool,
    ) -> Arc<TcpServer> {
        let name = name.to_string();
        let acceptor = Acceptor::new(base.clone(), listen_addr, reuse_port);
        let ip_port = acceptor.local_addr().to_string();
        let server = Arc::new(TcpServer {
            pool: Mutex::new(EventLoopThreadPool::new(base.clone(), name.clone())),
            base,
            name,
            ip_port,
            acceptor,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            connections: Mutex::new(empty!()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(move |stream, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(stream, peer_addr);
                }
            });
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Number of I/O loops accepting distributed connections; call before
    /// [`TcpServer::start`].
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static) {
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConn) + Send + Sync + 'static) {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConn, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&TcpConn) + Send + Sync + 'static) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Starts the pool and the listener; idempotent.
    pub fn start(self: &Arc<Self>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let init = self.thread_init_cb.lock().unwrap().clone();
            self.pool.lock().unwrap().start(init);
            let acceptor = self.acceptor.clone();
            self.base.run_in_loop(move || acceptor.listen());
        }
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let io_loop = self.pool.lock().unwrap().next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{id}", self.name, self.ip_port);
        log::info!(target: "server", "{}: connection {conn_name} from {peer_addr}", self.name);
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                log::error!(target: "server", "{}: cannot query local address: {err}", self.name);
                self.acceptor.local_addr()
            }
        };
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), stream, local_addr, peer_addr);
        self.connections.lock().unwrap().insert(conn_name, conn.clone());
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's loop (the close path); map surgery happens on
    /// the base loop, the final teardown back on the connection's loop,
    /// deferred so the channel is never destroyed mid-dispatch.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConn) {
        let server = self.clone();
        let conn = conn.clone();
        self.base
            .run_in_loop(move || server.remove_connection_in_base(&conn));
    }

    fn remove_connection_in_base(&self, conn: &TcpConn) {
        log::info!(target: "server", "{}: removing connection {}", self.name, conn.name());
        self.connections.lock().unwrap().remove(conn.name());
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConn> = self.connections.lock().unwrap().drain().map(|(_, conn)| conn).collect();
        for conn in connections {
            let destroyed = conn.clone();
            conn.owner_loop()
                .run_in_loop(move || destroyed.connect_destroyed());
        }
    }
}
