use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConn, TcpConnection, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// Client facade: drives a [`Connector`] and wires its one established
/// socket into a [`TcpConnection`].
pub struct TcpClient {
    owner: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    /// Reconnect via [`Connector::restart`] when an established connection
    /// closes.
    retry: AtomicBool,
    /// Cleared by `disconnect`/`stop`; a connection is only installed while
    /// armed.
    armed: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConn>>,
}

impl TcpClient {
    pub fn new(owner: Arc<EventLoop>, server_addr: SocketAddr, name: impl ToString) -> Arc<TcpClient> {
        let connector = Connector::new(owner.clone(), server_addr);
        let client = Arc::new(TcpClient {
            owner,
            connector,
            name: name.to_string(),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });
        let weak = Arc::downgrade(&client);
        client.connector.set_new_socket_callback(move |stream| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(stream);
            }
        });
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The established connection, while one exists.
    pub fn connection(&self) -> Option<TcpConn> {
        self.connection.lock().unwrap().clone()
    }

    pub fn set_retry(&self, retry: bool) {
        self.retry.store(retry, Ordering::Release);
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

    pub fn connect(self: &Arc<Self>) {
        log::info!(target: "client", "{}: connecting to {}", self.name, self.connector.server_addr());
        self.armed.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Graceful: half-closes the established connection, if any.
    pub fn disconnect(&self) {
        self.armed.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    /// Cancels an in-flight connect attempt.
    pub fn stop(&self) {
        self.armed.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream) {
        debug_assert!(self.owner.is_in_loop_thread());
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let peer_addr = stream.peer_addr().unwrap_or_else(|err| {
            log::error!(target: "client", "{}: cannot query peer address: {err}", self.name);
            self.connector.server_addr()
        });
        let local_addr = stream.local_addr().unwrap_or_else(|err| {
            log::error!(target: "client", "{}: cannot query local address: {err}", self.name);
            unspecified
        });
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{peer_addr}#{id}", self.name);
        let conn = TcpConnection::new(self.owner.clone(), conn_name, stream, local_addr, peer_addr);
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
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));
        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConn) {
        debug_assert!(self.owner.is_in_loop_thread());
        *self.connection.lock().unwrap() = None;
        let destroyed = conn.clone();
        self.owner.queue_in_loop(move || destroyed.connect_destroyed());
        if self.retry.load(Ordering::Acquire) && self.armed.load(Ordering::Acquire) {
            log::info!(target: "client", "{}: reconnecting to {}", self.name, self.connector.server_addr());
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let conn = self.connection.lock().unwrap().take();
        match conn {
            Some(conn) => {
                // the client is going away; route the close path straight to
                // loop-level teardown, and only kill the session ourselves if
                // nobody else still holds it
                let lp = self.owner.clone();
                conn.set_close_callback(Arc::new(move |conn: &TcpConn| {
                    let destroyed = conn.clone();
                    lp.queue_in_loop(move || destroyed.connect_destroyed());
                }));
                if Arc::strong_count(&conn) == 1 {
                    conn.force_close();
                }
            }
            None => self.connector.stop(),
        }
    }
}
