use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::channel::Channel;
use crate::poller::{EpollPoller, Poller};
use crate::time::Timestamp;
use crate::timer::{TimerId, TimerQueue};

/// Upper bound for one blocking readiness wait; cross-thread wakeups and
/// timer expiry cut it short.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Unit of deferred work executed in the loop's functor drain.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// Scheduling kernel of the engine: one readiness multiplexer, one timer
/// queue, a cross-thread wakeup channel and a pending-functor queue, all
/// driven by a single thread.
///
/// Exactly one loop may exist per thread; constructing a second one on the
/// same thread is a fatal configuration error. Any thread may hand work to a
/// loop through [`EventLoop::run_in_loop`]/[`EventLoop::queue_in_loop`], but
/// only the owning thread ever touches the loop's channels, buffers and
/// connections.
pub struct EventLoop {
    thread: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poller: Mutex<Box<dyn Poller>>,
    timers: TimerQueue,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Creates the loop owned by the calling thread.
    ///
    /// Fatal if this thread already owns a loop, or if the wakeup/timer/epoll
    /// primitives cannot be created.
    pub fn new() -> Arc<EventLoop> {
        CURRENT_LOOP.with(|cur| {
            if cur.borrow().upgrade().is_some() {
                log::error!(target: "loop", "another event loop already owns thread {:?}", thread::current().id());
                panic!("another event loop already exists on this thread");
            }
        });
        let wakeup_fd = create_eventfd();
        let lp = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::with_weak(weak.clone(), wakeup_fd.as_raw_fd());
            let raw = wakeup_fd.as_raw_fd();
            wakeup_channel.set_read_callback(move |_| {
                let mut one = 0u64;
                let n = unsafe { libc::read(raw, &mut one as *mut u64 as *mut libc::c_void, 8) };
                if n != 8 {
                    log::error!(target: "loop", "wakeup read returned {n} bytes instead of 8");
                }
            });
            EventLoop {
                thread: thread::current().id(),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                poller: Mutex::new(Box::new(EpollPoller::new())),
                timers: TimerQueue::new(weak.clone()),
                pending: Mutex::new(empty!()),
                wakeup_fd,
                wakeup_channel,
            }
        });
        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Arc::downgrade(&lp));
        lp.wakeup_channel.enable_reading();
        lp.timers.arm();
        log::debug!(target: "loop", "event loop created on thread {:?}", lp.thread);
        lp
    }

    /// The loop owned by the calling thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|cur| cur.borrow().upgrade())
    }

    /// Runs until [`EventLoop::quit`] is observed.
    ///
    /// Each iteration polls the multiplexer with a bounded timeout,
    /// dispatches every ready channel synchronously, then drains the
    /// pending-functor queue. Must be called from the owning thread and must
    /// not be re-entered.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called from a foreign thread"
        );
        assert!(
            !self.looping.swap(true, Ordering::AcqRel),
            "EventLoop::run re-entered"
        );
        log::trace!(target: "loop", "event loop starts looping");
        let mut active: Vec<Arc<Channel>> = empty!();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let at = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT, &mut active);
            for channel in &active {
                channel.handle_event(at);
            }
            self.drain_pending();
        }
        log::trace!(target: "loop", "event loop stops looping");
        self.looping.store(false, Ordering::Release);
    }

    /// Requests the loop to stop; callable from any thread. From a foreign
    /// thread the loop is woken so the flag is observed promptly rather than
    /// after the poll timeout.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.thread == thread::current().id()
    }

    /// Runs `task` synchronously when called from the owning thread,
    /// otherwise queues it for the loop's next functor drain.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending-functor queue.
    ///
    /// The loop is woken when the caller is a foreign thread, and also when
    /// the loop thread itself queues from within the drain — a functor queued
    /// by another functor must not wait out the next poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Schedules `cb` at the absolute time `when`; safe from any thread.
    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timers.add_timer(Box::new(cb), when, Duration::ZERO)
    }

    /// Schedules `cb` once, `delay` from now; safe from any thread.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Timestamp::now() + delay, cb)
    }

    /// Schedules `cb` repeatedly every `interval`, first firing one interval
    /// from now; safe from any thread.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timers
            .add_timer(Box::new(cb), Timestamp::now() + interval, interval)
    }

    /// Cancels a pending timer; a timer whose callback is already running is
    /// not interrupted, and a repeating timer canceled from within the firing
    /// batch is not rescheduled.
    pub fn cancel(&self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    /// Valid only on the owning thread; channel mutators already run in-loop,
    /// which is why this is a documented precondition rather than a per-call
    /// check.
    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timers
    }

    fn drain_pending(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // swap out under the lock so functors run unlocked and new arrivals
        // land in a fresh list
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn wakeup(&self) {
        let one = 1u64;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            log::error!(target: "loop", "wakeup write returned {n} bytes instead of 8");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // only meaningful when dropped on the owning thread; a loop released
        // elsewhere belongs to a thread that has already exited
        if self.thread == thread::current().id() {
            CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Weak::new());
        }
    }
}

fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        log::error!(target: "loop", "cannot create wakeup eventfd: {err}");
        panic!("cannot create wakeup eventfd: {err}");
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}
