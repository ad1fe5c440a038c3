use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::{EventLoopThread, TcpClient, TcpConn, TcpServer};

#[test]
fn one_mebibyte_echo_reaches_idle_steady_state() {
    const TOTAL: usize = 1024 * 1024;

    let mut server_thread = EventLoopThread::new("echo-server");
    let server_lp = server_thread.start(None);
    let server = TcpServer::new(server_lp, "127.0.0.1:0".parse().unwrap(), "echo", false);
    server.set_thread_num(2);
    server.set_message_callback(|conn, buf, _at| {
        conn.send(&buf.retrieve_all_bytes());
    });
    let addr = server.local_addr();
    server.start();

    let mut client_thread = EventLoopThread::new("echo-client");
    let client_lp = client_thread.start(None);
    let client = TcpClient::new(client_lp, addr, "echo-client");
    let received = Arc::new(AtomicUsize::new(0));
    let stray = Arc::new(AtomicUsize::new(0));
    let (done_send, done_recv) = chan::bounded(1);
    client.set_connection_callback(move |conn| {
        if conn.is_connected() {
            conn.send(&vec![b'a'; TOTAL]);
        }
    });
    {
        let received = received.clone();
        let stray = stray.clone();
        client.set_message_callback(move |_conn, buf, _at| {
            let bytes = buf.retrieve_all_bytes();
            stray.fetch_add(
                bytes.iter().filter(|byte| **byte != b'a').count(),
                Ordering::SeqCst,
            );
            if received.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len() >= TOTAL {
                let _ = done_send.send(());
            }
        });
    }
    client.connect();
    done_recv
        .recv_timeout(Duration::from_secs(30))
        .expect("echo burst never completed");

    // idle steady state: the burst is over, nothing further flows and both
    // sides stay connected
    thread::sleep(Duration::from_millis(200));
    assert_eq!(received.load(Ordering::SeqCst), TOTAL);
    assert_eq!(stray.load(Ordering::SeqCst), 0);
    let conn = client.connection().expect("connection still installed");
    assert!(conn.is_connected());
}

#[test]
fn shutdown_delivers_every_queued_byte_before_half_close() {
    const TOTAL: usize = 4 * 1024 * 1024;

    let mut server_thread = EventLoopThread::new("drain-server");
    let server_lp = server_thread.start(None);
    let server = TcpServer::new(server_lp, "127.0.0.1:0".parse().unwrap(), "drain", false);
    let received = Arc::new(AtomicUsize::new(0));
    let (done_send, done_recv) = chan::bounded(1);
    {
        let received = received.clone();
        server.set_message_callback(move |_conn, buf, _at| {
            received.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
            buf.retrieve_all();
        });
    }
    {
        let received = received.clone();
        server.set_connection_callback(move |conn| {
            if !conn.is_connected() {
                let _ = done_send.send(received.load(Ordering::SeqCst));
            }
        });
    }
    let addr = server.local_addr();
    server.start();

    let mut client_thread = EventLoopThread::new("drain-client");
    let client_lp = client_thread.start(None);
    let client = TcpClient::new(client_lp, addr, "drain-client");
    client.set_connection_callback(move |conn| {
        if conn.is_connected() {
            // far more than the kernel accepts at once, then an immediate
            // shutdown: the half-close must wait for the full drain
            conn.send(&vec![b'x'; TOTAL]);
            conn.shutdown();
        }
    });
    client.connect();
    let delivered = done_recv
        .recv_timeout(Duration::from_secs(30))
        .expect("server never observed the close");
    assert_eq!(delivered, TOTAL);
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    const MARK: usize = 64 * 1024;

    let mut server_thread = EventLoopThread::new("hwm-server");
    let server_lp = server_thread.start(None);
    let server = TcpServer::new(server_lp, "127.0.0.1:0".parse().unwrap(), "hwm", false);
    let crossings = Arc::new(AtomicUsize::new(0));
    let (conn_send, conn_recv) = chan::bounded::<TcpConn>(1);
    {
        let crossings = crossings.clone();
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                conn.set_high_water_mark(MARK);
                let crossings = crossings.clone();
                conn.set_high_water_mark_callback(Arc::new(move |_conn, _queued| {
                    crossings.fetch_add(1, Ordering::SeqCst);
                }));
                let _ = conn_send.send(conn.clone());
            }
        });
    }
    let addr = server.local_addr();
    server.start();

    // a raw peer that never reads: kernel buffers fill, output queues up
    let peer = TcpStream::connect(addr).unwrap();
    let conn = conn_recv.recv_timeout(Duration::from_secs(5)).unwrap();
    let chunk = vec![b'z'; 8 * 1024 * 1024];
    for _ in 0..4 {
        conn.send(&chunk);
    }
    thread::sleep(Duration::from_millis(500));
    // one below→above crossing, no re-fire while the queue stays above
    assert_eq!(crossings.load(Ordering::SeqCst), 1);
    assert!(conn.queued_bytes() > MARK);
    conn.force_close();
    drop(peer);
}

#[test]
fn force_close_mid_write_closes_once_without_write_complete() {
    let mut server_thread = EventLoopThread::new("force-server");
    let server_lp = server_thread.start(None);
    let server = TcpServer::new(server_lp, "127.0.0.1:0".parse().unwrap(), "force", false);
    let downs = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let (conn_send, conn_recv) = chan::bounded::<TcpConn>(1);
    {
        let downs = downs.clone();
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                let _ = conn_send.send(conn.clone());
            } else {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(move |_conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        });
    }
    let addr = server.local_addr();
    server.start();

    let peer = TcpStream::connect(addr).unwrap();
    let conn = conn_recv.recv_timeout(Duration::from_secs(5)).unwrap();
    // the peer never reads, so this cannot fully drain
    conn.send(&vec![b'q'; 32 * 1024 * 1024]);
    thread::sleep(Duration::from_millis(200));
    assert!(conn.queued_bytes() > 0, "output must still be queued");
    conn.force_close();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(downs.load(Ordering::SeqCst), 1);
    assert_eq!(write_completes.load(Ordering::SeqCst), 0);
    assert!(!conn.is_connected());
    drop(peer);
}

#[test]
fn reuse_port_servers_share_an_address() {
    let mut thread_one = EventLoopThread::new("reuse-1");
    let lp_one = thread_one.start(None);
    let server_one = TcpServer::new(lp_one, "127.0.0.1:0".parse().unwrap(), "reuse-1", true);
    let addr = server_one.local_addr();

    let mut thread_two = EventLoopThread::new("reuse-2");
    let lp_two = thread_two.start(None);
    // binding the very same address must succeed on an independent loop
    let server_two = TcpServer::new(lp_two, addr, "reuse-2", true);
    assert_eq!(server_two.local_addr(), addr);

    server_one.start();
    server_two.start();
    thread::sleep(Duration::from_millis(100));
    let peer = TcpStream::connect(addr).unwrap();
    drop(peer);
}
