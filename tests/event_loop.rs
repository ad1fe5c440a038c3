use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netloop::EventLoop;

#[test]
fn run_in_loop_is_synchronous_on_owner_thread() {
    let lp = EventLoop::new();
    let flag = Arc::new(AtomicBool::new(false));
    let f = flag.clone();
    lp.run_in_loop(move || f.store(true, Ordering::SeqCst));
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn current_returns_the_thread_loop() {
    let lp = EventLoop::new();
    let cur = EventLoop::current().expect("loop registered for this thread");
    assert!(Arc::ptr_eq(&lp, &cur));
    drop(cur);
    drop(lp);
    assert!(EventLoop::current().is_none());
}

#[test]
fn foreign_thread_work_is_marshaled() {
    let lp = EventLoop::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = {
        let lp = lp.clone();
        let counter = counter.clone();
        thread::spawn(move || {
            assert!(!lp.is_in_loop_thread());
            let c = counter.clone();
            let quit = lp.clone();
            lp.run_in_loop(move || {
                c.fetch_add(1, Ordering::SeqCst);
                quit.quit();
            });
        })
    };
    lp.run();
    handle.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn functor_queued_during_drain_runs_promptly() {
    let lp = EventLoop::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let lp = lp.clone();
        let order = order.clone();
        thread::spawn(move || {
            let outer_order = order.clone();
            let inner_lp = lp.clone();
            lp.queue_in_loop(move || {
                outer_order.lock().unwrap().push("outer");
                let inner_order = outer_order.clone();
                let quit = inner_lp.clone();
                inner_lp.queue_in_loop(move || {
                    inner_order.lock().unwrap().push("inner");
                    quit.quit();
                });
            });
        })
    };
    let started = Instant::now();
    lp.run();
    handle.join().unwrap();
    // the re-entrant enqueue forces a wakeup, so nothing waits out the
    // 10-second poll timeout
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
}

#[test]
fn foreign_quit_wakes_the_loop() {
    let lp = EventLoop::new();
    let started = Instant::now();
    let quitter = {
        let lp = lp.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            lp.quit();
        })
    };
    lp.run();
    quitter.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn second_loop_on_thread_is_fatal() {
    let second_failed = thread::spawn(|| {
        let _lp = EventLoop::new();
        std::panic::catch_unwind(|| EventLoop::new()).is_err()
    })
    .join()
    .unwrap();
    assert!(second_failed);
}
