use std::env;

use netloop::{EventLoop, TcpClient};

fn main() {
    env_logger::init();
    let port: u16 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7777);
    let lp = EventLoop::new();
    let client = TcpClient::new(lp.clone(), ([127, 0, 0, 1], port).into(), "echo-client");
    let payload = vec![b'a'; 1024 * 1024];
    client.set_connection_callback(move |conn| {
        if conn.is_connected() {
            conn.send(&payload);
        }
    });
    client.set_message_callback(|conn, buf, _at| {
        conn.send(&buf.retrieve_all_bytes());
    });
    client.connect();
    lp.run();
}
