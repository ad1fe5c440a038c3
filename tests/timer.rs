use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netloop::{EventLoop, Timestamp};

#[test]
fn timers_fire_in_ascending_expiry_order() {
    let lp = EventLoop::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for (delay_ms, tag) in [(60u64, 2u32), (20, 0), (40, 1)] {
        let order = order.clone();
        lp.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(tag);
        });
    }
    let quit = lp.clone();
    lp.run_after(Duration::from_millis(120), move || quit.quit());
    lp.run();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn equal_expiries_fire_in_creation_order() {
    let lp = EventLoop::new();
    let when = Timestamp::now() + Duration::from_millis(50);
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..4u32 {
        let order = order.clone();
        lp.run_at(when, move || order.lock().unwrap().push(tag));
    }
    let quit = lp.clone();
    lp.run_after(Duration::from_millis(100), move || quit.quit());
    lp.run();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn canceled_timer_never_fires() {
    let lp = EventLoop::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let id = lp.run_after(Duration::from_millis(50), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    lp.cancel(id);
    let quit = lp.clone();
    lp.run_after(Duration::from_millis(100), move || quit.quit());
    lp.run();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_from_sibling_callback_in_same_batch() {
    let lp = EventLoop::new();
    let when = Timestamp::now() + Duration::from_millis(50);
    let victim_id = Arc::new(Mutex::new(None));
    let fired = Arc::new(AtomicUsize::new(0));
    {
        // created first, so its lower sequence fires first on the shared
        // expiry and cancels its sibling mid-batch
        let canceler_lp = lp.clone();
        let victim_id = victim_id.clone();
        lp.run_at(when, move || {
            if let Some(id) = *victim_id.lock().unwrap() {
                canceler_lp.cancel(id);
            }
        });
    }
    {
        let fired = fired.clone();
        let id = lp.run_at(when, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        *victim_id.lock().unwrap() = Some(id);
    }
    let quit = lp.clone();
    lp.run_after(Duration::from_millis(100), move || quit.quit());
    lp.run();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn repeating_timer_fires_until_canceled() {
    let lp = EventLoop::new();
    let count = Arc::new(AtomicUsize::new(0));
    let id_slot = Arc::new(Mutex::new(None));
    {
        let count = count.clone();
        let id_slot_cl = id_slot.clone();
        let quit = lp.clone();
        let id = lp.run_every(Duration::from_millis(20), move || {
            let fired = count.fetch_add(1, Ordering::SeqCst) + 1;
            if fired == 3 {
                if let Some(id) = *id_slot_cl.lock().unwrap() {
                    quit.cancel(id);
                }
                quit.quit();
            }
        });
        *id_slot.lock().unwrap() = Some(id);
    }
    lp.run();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn one_shot_timer_fires_exactly_once() {
    let lp = EventLoop::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    lp.run_after(Duration::from_millis(20), move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let quit = lp.clone();
    lp.run_after(Duration::from_millis(150), move || quit.quit());
    lp.run();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn timers_schedule_from_foreign_threads() {
    let lp = EventLoop::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = {
        let lp = lp.clone();
        let fired = fired.clone();
        thread::spawn(move || {
            let f = fired.clone();
            let quit = lp.clone();
            lp.run_after(Duration::from_millis(30), move || {
                f.fetch_add(1, Ordering::SeqCst);
                quit.quit();
            });
        })
    };
    handle.join().unwrap();
    lp.run();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
