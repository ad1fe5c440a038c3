use std::env;

use netloop::{EventLoop, TcpServer};

fn main() {
    env_logger::init();
    let port: u16 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7777);
    let lp = EventLoop::new();
    let server = TcpServer::new(
        lp.clone(),
        ([0, 0, 0, 0], port).into(),
        "echo-server",
        false,
    );
    server.set_thread_num(2);
    server.set_connection_callback(|conn| {
        log::info!(
            "echo: {} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.is_connected() { "up" } else { "down" }
        );
    });
    server.set_message_callback(|conn, buf, _at| {
        conn.send(&buf.retrieve_all_bytes());
    });
    log::info!("echo server on {}", server.local_addr());
    server.start();
    lp.run();
}
