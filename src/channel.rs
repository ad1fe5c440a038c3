use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event_loop::EventLoop;
use crate::poller::{Interest, Ready, Registration};
use crate::time::Timestamp;

/// Callback for read readiness; receives the poll return time.
pub type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;

/// Callback for write readiness, close and error events.
pub type EventCallback = Box<dyn FnMut() + Send>;

/// Binds one file descriptor to a set of readiness callbacks.
///
/// A channel never owns its fd; the object driving it (connection, acceptor,
/// connector, or the loop's own wakeup/timer plumbing) does. Apart from the
/// thread-safe callback/tie setters, a channel is only ever touched from its
/// owning loop's thread — that single-writer discipline is what makes the
/// plain atomic fields sufficient.
pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU8,
    ready: AtomicU8,
    registration: AtomicU8,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_cb: Mutex<Option<ReadCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
}

impl Channel {
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Channel::with_weak(Arc::downgrade(owner), fd)
    }

    pub(crate) fn with_weak(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            owner,
            fd,
            interest: AtomicU8::new(Interest::NONE.bits()),
            ready: AtomicU8::new(Ready::EMPTY.bits()),
            registration: AtomicU8::new(Registration::New as u8),
            tie: Mutex::new(None),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    /// Readiness observed for this channel in the last poll.
    pub fn ready(&self) -> Ready {
        Ready::from_bits(self.ready.load(Ordering::Acquire))
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.ready.store(ready.bits(), Ordering::Release);
    }

    pub(crate) fn registration(&self) -> Registration {
        Registration::from_u8(self.registration.load(Ordering::Acquire))
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        self.registration.store(registration as u8, Ordering::Release);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + Send + 'static) {
        *self.read_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.write_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.close_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        *self.error_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Ties dispatch to the liveness of `owner`.
    ///
    /// Before any callback fires, the guard is resolved to a strong reference
    /// held for the duration of the dispatch; if the owner is already gone the
    /// event is silently dropped. This is what prevents dispatching into an
    /// object that was released while its fd removal was still pending.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.set_interest(self.interest().add(Interest::READ));
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.set_interest(self.interest().remove(Interest::READ));
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.set_interest(self.interest().add(Interest::WRITE));
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.set_interest(self.interest().remove(Interest::WRITE));
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.set_interest(Interest::NONE);
    }

    /// Unregisters the channel from the owning loop's poller.
    pub fn remove(self: &Arc<Self>) {
        if let Some(lp) = self.owner.upgrade() {
            lp.remove_channel(self);
        }
    }

    fn set_interest(self: &Arc<Self>, interest: Interest) {
        self.interest.store(interest.bits(), Ordering::Release);
        if let Some(lp) = self.owner.upgrade() {
            lp.update_channel(self);
        }
    }

    /// Interprets the last-observed readiness mask and runs the matching
    /// callbacks. Runs on the owning loop's thread, synchronously within the
    /// poll iteration that observed the events.
    pub fn handle_event(self: &Arc<Self>, at: Timestamp) {
        let tied = self.tie.lock().unwrap().clone();
        let _guard = match tied {
            Some(tie) => match tie.upgrade() {
                Some(owner) => Some(owner),
                None => {
                    log::trace!(target: "loop", "event for fd {} dropped: owner is gone", self.fd);
                    return;
                }
            },
            None => None,
        };
        self.dispatch(at);
    }

    fn dispatch(&self, at: Timestamp) {
        let ready = self.ready();
        log::trace!(target: "loop", "fd {} dispatching {ready:?}", self.fd);
        if ready.is_hang_up() && !ready.is_readable() {
            if let Some(cb) = self.close_cb.lock().unwrap().as_mut() {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = self.error_cb.lock().unwrap().as_mut() {
                cb();
            }
        }
        if ready.is_readable() {
            if let Some(cb) = self.read_cb.lock().unwrap().as_mut() {
                cb(at);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = self.write_cb.lock().unwrap().as_mut() {
                cb();
            }
        }
    }
}
