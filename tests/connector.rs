use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::{Connector, ConnectorState, EventLoopThread, INIT_RETRY_DELAY};

#[test]
fn connects_and_hands_over_the_socket() {
    let mut loop_thread = EventLoopThread::new("connector-ok");
    let lp = loop_thread.start(None);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (send, recv) = chan::bounded(1);
    let connector = Connector::new(lp, addr);
    connector.set_new_socket_callback(move |stream| {
        send.send(stream.peer_addr().unwrap()).unwrap();
    });
    connector.start();
    let (peer, _) = listener.accept().unwrap();
    let handed = recv.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(handed, addr);
    assert_eq!(connector.state(), ConnectorState::Connected);
    drop(peer);
}

#[test]
fn refused_connect_backs_off_and_doubles() {
    let mut loop_thread = EventLoopThread::new("connector-refused");
    let lp = loop_thread.start(None);
    // reserve a free port, then close it so nothing listens there
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let connector = Connector::new(lp, ([127, 0, 0, 1], port).into());
    let handed = Arc::new(AtomicUsize::new(0));
    {
        let handed = handed.clone();
        connector.set_new_socket_callback(move |_stream| {
            handed.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(connector.retry_delay(), INIT_RETRY_DELAY);
    connector.start();
    thread::sleep(Duration::from_millis(200));
    // the first attempt was refused; a retry is pending at the doubled delay
    assert_eq!(connector.state(), ConnectorState::Disconnected);
    assert_eq!(connector.retry_delay(), INIT_RETRY_DELAY * 2);
    assert_eq!(handed.load(Ordering::SeqCst), 0);
    connector.stop();
}

#[test]
fn stop_discards_the_attempt_without_handing_over() {
    let mut loop_thread = EventLoopThread::new("connector-stop");
    let lp = loop_thread.start(None);
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let connector = Connector::new(lp, ([127, 0, 0, 1], port).into());
    let handed = Arc::new(AtomicUsize::new(0));
    {
        let handed = handed.clone();
        connector.set_new_socket_callback(move |_stream| {
            handed.fetch_add(1, Ordering::SeqCst);
        });
    }
    connector.start();
    thread::sleep(Duration::from_millis(50));
    assert_ne!(connector.state(), ConnectorState::Connected);
    connector.stop();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(connector.state(), ConnectorState::Disconnected);
    assert_eq!(handed.load(Ordering::SeqCst), 0);
    // a disarmed connector never fires its scheduled retries either
    thread::sleep(Duration::from_millis(600));
    assert_eq!(handed.load(Ordering::SeqCst), 0);
}
