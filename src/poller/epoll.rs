use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::time::Timestamp;

use super::{Interest, Poller, Ready, Registration};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Reference [`Poller`] over Linux epoll, level-triggered.
///
/// Level triggering is load-bearing: the acceptor takes exactly one
/// connection per readable event and the connection read path may leave bytes
/// in the socket, so readiness must keep re-reporting while data or backlog
/// remains.
pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    /// Fatal if the kernel refuses to create the epoll instance; the engine
    /// has no degraded mode without its readiness primitive.
    pub fn new() -> EpollPoller {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::error!(target: "poller", "cannot create epoll instance: {err}");
            panic!("cannot create epoll instance: {err}");
        }
        EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: empty!(),
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                log::error!(target: "poller", "epoll_ctl del for fd {fd} failed: {err}");
            } else {
                log::error!(target: "poller", "epoll_ctl add/mod for fd {fd} failed: {err}");
                panic!("epoll_ctl add/mod for fd {fd} failed: {err}");
            }
        }
    }
}

impl Default for EpollPoller {
    fn default() -> Self {
        EpollPoller::new()
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
            )
        };
        let now = Timestamp::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!(target: "poller", "epoll_wait failed: {err}");
            }
            return now;
        }
        let n = n as usize;
        if n > 0 {
            log::trace!(target: "poller", "{n} events happened");
        }
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_ready(epoll_to_ready(event.events));
                active.push(channel.clone());
            }
        }
        if n == self.events.len() {
            // the ready set filled the list; give the next poll more room
            let grown = self.events.len() * 2;
            self.events.resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        log::trace!(target: "poller", "update channel for fd {fd}: {:?}", channel.interest());
        match channel.registration() {
            Registration::New => {
                self.channels.insert(fd, channel.clone());
                channel.set_registration(Registration::Active);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Inactive => {
                channel.set_registration(Registration::Active);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Active => {
                if channel.interest().is_none() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_registration(Registration::Inactive);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        if self.channels.remove(&fd).is_none() {
            // double removal is explicitly safe
            return;
        }
        log::trace!(target: "poller", "remove channel for fd {fd}");
        if channel.registration() == Registration::Active {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_registration(Registration::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |known| std::ptr::eq(known.as_ref(), channel))
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_ready(events: u32) -> Ready {
    let mut ready = Ready::EMPTY;
    if events & libc::EPOLLIN as u32 != 0 {
        ready = ready.combine(Ready::READABLE);
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        ready = ready.combine(Ready::PRIORITY);
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        ready = ready.combine(Ready::WRITABLE);
    }
    if events & libc::EPOLLERR as u32 != 0 {
        ready = ready.combine(Ready::ERROR);
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        ready = ready.combine(Ready::HANG_UP);
    }
    ready
}
