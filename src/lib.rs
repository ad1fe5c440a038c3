//! Multi-reactor non-blocking TCP I/O engine.
//!
//! The engine multiplexes many non-blocking TCP sockets over a small number
//! of OS threads, each running an independent [`EventLoop`]. Loops own their
//! channels, buffers and connections exclusively; any thread may hand work
//! to a loop, but only the loop's own thread touches loop-owned state. This
//! single-writer discipline replaces per-object locking, the same principle
//! async runtimes apply but with a plain synchronous callback API and no
//! heap of runtime dependencies.
//!
//! Connection establishment comes in both directions: [`Acceptor`] for
//! passive opens and [`Connector`] for active opens with exponential-backoff
//! retry. [`TcpServer`] and [`TcpClient`] wire those into shared
//! [`TcpConnection`] sessions distributed over an [`EventLoopThreadPool`].

#[macro_use]
extern crate amplify;

pub mod buffer;
pub mod poller;

mod acceptor;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod pool;
mod server;
mod time;
mod timer;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::Buffer;
pub use channel::{Channel, EventCallback, ReadCallback};
pub use client::TcpClient;
pub use connection::{
    CloseCallback, ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConn, TcpConnection, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use connector::{
    Connector, ConnectorState, NewSocketCallback, INIT_RETRY_DELAY, MAX_RETRY_DELAY,
};
pub use event_loop::{EventLoop, Task};
pub use pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use time::Timestamp;
pub use timer::{TimerCallback, TimerId};
