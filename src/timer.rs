use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Floor for the relative expiry armed into the timer fd, so a late or
/// already-due timer never produces a zero/negative request.
const MIN_DELAY_MICROS: i64 = 100;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque cancellation handle.
///
/// Wraps the timer's globally unique, monotonically increasing sequence
/// number; the sequence disambiguates cancellation races against firing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimerId(u64);

struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    fn new(callback: TimerCallback, when: Timestamp, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration: when,
            repeat: interval > Duration::ZERO,
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Repeats reschedule from `now`, not from the old expiry, so a late
    /// wakeup does not amplify drift into a burst of back-to-back firings.
    fn restart(&mut self, now: Timestamp) {
        self.expiration = now + self.interval;
    }
}

#[derive(Default)]
struct TimerList {
    /// Total order on (expiry, sequence); the sequence breaks ties between
    /// simultaneous expirations deterministically.
    timers: BTreeMap<(Timestamp, u64), Timer>,
    /// sequence → current expiry, for cancellation lookup.
    active: HashMap<u64, Timestamp>,
    /// Set while the expired batch executes.
    firing: bool,
    /// Timers canceled from within the current firing batch; they are
    /// skipped and never rescheduled, instead of being erased out from under
    /// the iteration in progress.
    canceled: HashSet<u64>,
}

/// Ordered set of pending timers backed by a timer fd.
///
/// The fd rides the owning loop like any other channel: its readiness means
/// "at least one timer has expired". Insertion and cancellation marshal
/// through the loop so the ordered set is only ever touched on the loop
/// thread.
pub(crate) struct TimerQueue {
    owner: Weak<EventLoop>,
    timer_fd: OwnedFd,
    channel: Arc<Channel>,
    list: Mutex<TimerList>,
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<EventLoop>) -> TimerQueue {
        let timer_fd = create_timerfd();
        let channel = Channel::with_weak(owner.clone(), timer_fd.as_raw_fd());
        let weak = owner.clone();
        let raw = timer_fd.as_raw_fd();
        channel.set_read_callback(move |at| {
            drain_timerfd(raw, at);
            if let Some(lp) = weak.upgrade() {
                lp.timer_queue().handle_expired(at);
            }
        });
        TimerQueue {
            owner,
            timer_fd,
            channel,
            list: Mutex::new(default!()),
        }
    }

    /// Arms the timer channel's read interest; called once the owning loop's
    /// construction completes.
    pub(crate) fn arm(&self) {
        self.channel.enable_reading();
    }

    /// Schedules a one-shot (`interval == 0`) or repeating timer; safe from
    /// any thread — the insertion happens on the loop thread.
    pub(crate) fn add_timer(
        &self,
        callback: TimerCallback,
        when: Timestamp,
        interval: Duration,
    ) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = TimerId(timer.sequence);
        if let Some(lp) = self.owner.upgrade() {
            let weak = self.owner.clone();
            lp.run_in_loop(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.timer_queue().add_in_loop(timer);
                }
            });
        }
        id
    }

    /// Requests cancellation; safe from any thread. Takes effect at the next
    /// safe reentry point, never preemptively.
    pub(crate) fn cancel(&self, id: TimerId) {
        if let Some(lp) = self.owner.upgrade() {
            let weak = self.owner.clone();
            lp.run_in_loop(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.timer_queue().cancel_in_loop(id);
                }
            });
        }
    }

    fn add_in_loop(&self, timer: Timer) {
        let when = timer.expiration;
        let earliest_changed = {
            let mut list = self.list.lock().unwrap();
            let earliest = list.timers.keys().next().map(|(at, _)| *at);
            list.active.insert(timer.sequence, when);
            list.timers.insert((when, timer.sequence), timer);
            earliest.map_or(true, |at| when < at)
        };
        if earliest_changed {
            self.rearm(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        let mut list = self.list.lock().unwrap();
        if let Some(when) = list.active.remove(&id.0) {
            list.timers.remove(&(when, id.0));
        } else if list.firing {
            list.canceled.insert(id.0);
        }
    }

    /// Runs every timer expired by `now` in ascending-expiry order, then
    /// reschedules the surviving repeats and rearms the fd to the new
    /// minimum expiry (left disarmed when the set is empty).
    fn handle_expired(&self, now: Timestamp) {
        let mut expired: Vec<Timer> = {
            let mut list = self.list.lock().unwrap();
            let rest = list.timers.split_off(&(now, u64::MAX));
            let due = std::mem::replace(&mut list.timers, rest);
            for (_, sequence) in due.keys() {
                list.active.remove(sequence);
            }
            list.firing = true;
            list.canceled.clear();
            due.into_values().collect()
        };
        log::trace!(target: "timer", "{} timers expired at {now}", expired.len());
        for timer in &mut expired {
            // the lock is released while callbacks run; they may add or
            // cancel timers, including timers of this very batch
            if self.list.lock().unwrap().canceled.contains(&timer.sequence) {
                log::trace!(target: "timer", "timer {} canceled while firing", timer.sequence);
                continue;
            }
            (timer.callback)();
        }
        let next = {
            let mut list = self.list.lock().unwrap();
            list.firing = false;
            for mut timer in expired {
                if timer.repeat && !list.canceled.contains(&timer.sequence) {
                    timer.restart(now);
                    list.active.insert(timer.sequence, timer.expiration);
                    list.timers.insert((timer.expiration, timer.sequence), timer);
                }
            }
            list.canceled.clear();
            list.timers.keys().next().map(|(at, _)| *at)
        };
        if let Some(next) = next {
            self.rearm(next);
        }
    }

    fn rearm(&self, when: Timestamp) {
        let mut delay = when.micros() - Timestamp::now().micros();
        if delay < MIN_DELAY_MICROS {
            delay = MIN_DELAY_MICROS;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (delay / 1_000_000) as libc::time_t,
                tv_nsec: ((delay % 1_000_000) * 1_000) as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.timer_fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret != 0 {
            log::error!(target: "timer", "timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }
}

fn create_timerfd() -> OwnedFd {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        log::error!(target: "timer", "cannot create timer fd: {err}");
        panic!("cannot create timer fd: {err}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn drain_timerfd(fd: RawFd, at: Timestamp) {
    let mut expirations = 0u64;
    let n = unsafe { libc::read(fd, &mut expirations as *mut u64 as *mut libc::c_void, 8) };
    if n == 8 {
        log::trace!(target: "timer", "{expirations} expirations at {at}");
    } else {
        log::error!(target: "timer", "timer fd read returned {n} bytes instead of 8");
    }
}
