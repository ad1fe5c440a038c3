use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::event_loop::EventLoop;

/// Runs once on each freshly constructed loop, in its own thread.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns one thread running one event loop for the thread's entire lifetime.
pub struct EventLoopThread {
    name: String,
    lp: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl ToString) -> EventLoopThread {
        EventLoopThread {
            name: name.to_string(),
            lp: None,
            thread: None,
        }
    }

    /// Spawns the loop thread and blocks until its loop exists.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Arc<EventLoop> {
        let (send, recv) = chan::bounded(1);
        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let lp = EventLoop::new();
                if let Some(init) = &init {
                    init(&lp);
                }
                send.send(lp.clone())
                    .expect("loop owner vanished before the loop started");
                lp.run();
            })
            .expect("cannot spawn event loop thread");
        let lp = recv
            .recv()
            .expect("event loop thread died during startup");
        self.lp = Some(lp.clone());
        self.thread = Some(thread);
        lp
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let (Some(lp), Some(thread)) = (self.lp.take(), self.thread.take()) {
            lp.quit();
            if thread.join().is_err() {
                log::error!(target: "loop", "event loop thread {} panicked", self.name);
            }
        }
    }
}

/// N loop threads plus round-robin distribution; with zero threads the base
/// loop serves I/O itself.
pub struct EventLoopThreadPool {
    base: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base: Arc<EventLoop>, name: impl ToString) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: empty!(),
            loops: empty!(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        debug_assert!(!self.started);
        self.started = true;
        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base);
            }
            return;
        }
        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}-{i}", self.name));
            let lp = thread.start(init.clone());
            self.threads.push(thread);
            self.loops.push(lp);
        }
    }

    /// Next loop in round-robin order.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let lp = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        lp
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}
