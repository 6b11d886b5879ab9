//! Descriptor readiness registry on top of poll(2).
//!
//! Each registered descriptor carries an interest mask, a trigger mode and
//! a value of the caller's choosing. Edge-triggered entries only report a
//! condition again after it went away or was explicitly re-armed with
//! [`Poller::reset_events`] or [`Poller::listen`].

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Conditions a registration wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn poll_events(self) -> i16 {
        let mut events = 0;
        if self.contains(Interest::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Conditions that fired for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const READABLE: Ready = Ready(1);
    pub const WRITABLE: Ready = Ready(2);
    pub const ERROR: Ready = Ready(4);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    fn from_revents(revents: i16) -> Ready {
        let mut ready = 0;
        if revents & libc::POLLIN != 0 {
            ready |= Self::READABLE.0;
        }
        if revents & libc::POLLOUT != 0 {
            ready |= Self::WRITABLE.0;
        }
        if revents & !(libc::POLLIN | libc::POLLOUT) != 0 {
            ready |= Self::ERROR.0;
        }
        Ready(ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

#[derive(Debug)]
struct Entry<T> {
    trigger: Trigger,
    /// Read/write conditions reported by the previous wait.
    seen: i16,
    data: T,
}

/// Registry of descriptors, kept sorted so lookups are a binary search.
pub struct Poller<T> {
    fds: Vec<libc::pollfd>,
    entries: Vec<Entry<T>>,
}

impl<T> Default for Poller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Poller<T> {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn find(&self, fd: RawFd) -> Result<usize, usize> {
        self.fds.binary_search_by_key(&fd, |p| p.fd)
    }

    /// Register `fd` with no interest, or replace the value and trigger of
    /// an existing registration without touching its mask.
    pub fn add(&mut self, fd: RawFd, trigger: Trigger, data: T) {
        match self.find(fd) {
            Ok(pos) => {
                let entry = &mut self.entries[pos];
                entry.trigger = trigger;
                entry.data = data;
            }
            Err(pos) => {
                self.fds.insert(
                    pos,
                    libc::pollfd {
                        fd,
                        events: 0,
                        revents: 0,
                    },
                );
                self.entries.insert(
                    pos,
                    Entry {
                        trigger,
                        seen: 0,
                        data,
                    },
                );
            }
        }
    }

    /// Add or replace a registration and set its whole mask in one step.
    pub fn register(&mut self, fd: RawFd, trigger: Trigger, interest: Interest, data: T) {
        self.add(fd, trigger, data);
        if let Ok(pos) = self.find(fd) {
            self.fds[pos].events = interest.poll_events();
            self.entries[pos].seen &= !interest.poll_events();
        }
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<T> {
        let pos = self.find(fd).ok()?;
        self.fds.remove(pos);
        Some(self.entries.remove(pos).data)
    }

    /// Add `interest` to the mask. Newly listened conditions count as
    /// unseen, so an edge registration reports them on the next wait.
    pub fn listen(&mut self, fd: RawFd, interest: Interest) {
        if let Ok(pos) = self.find(fd) {
            let events = interest.poll_events();
            self.fds[pos].events |= events;
            self.entries[pos].seen &= !events;
        }
    }

    pub fn mute(&mut self, fd: RawFd, interest: Interest) {
        if let Ok(pos) = self.find(fd) {
            self.fds[pos].events &= !interest.poll_events();
        }
    }

    /// Forget what the last wait reported so an edge registration fires
    /// again while the condition persists.
    pub fn reset_events(&mut self, fd: RawFd) {
        if let Ok(pos) = self.find(fd) {
            self.entries[pos].seen = 0;
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.find(fd).is_ok()
    }

    pub fn data(&self, fd: RawFd) -> Option<&T> {
        self.find(fd).ok().map(|pos| &self.entries[pos].data)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        let pos = self.find(fd).ok()?;
        let events = self.fds[pos].events;
        let mut interest = Interest::NONE;
        if events & libc::POLLIN != 0 {
            interest |= Interest::READABLE;
        }
        if events & libc::POLLOUT != 0 {
            interest |= Interest::WRITABLE;
        }
        Some(interest)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block until a registered descriptor is ready or `timeout` passes
    /// (`None` waits forever), then call `f` once for every descriptor
    /// that fired. Returns how many fired; an interrupted wait fires none.
    pub fn wait<F>(&mut self, timeout: Option<Duration>, mut f: F) -> io::Result<usize>
    where
        F: FnMut(RawFd, Ready, &mut T),
    {
        let ms = timeout_ms(timeout);
        for p in &mut self.fds {
            p.revents = 0;
        }
        // SAFETY: the pointer and length describe our own live vector.
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(0);
        }

        let mut fired = 0;
        for (p, entry) in self.fds.iter().zip(self.entries.iter_mut()) {
            let mut revents = p.revents;
            let previous = entry.seen;
            entry.seen = revents & (libc::POLLIN | libc::POLLOUT);
            if entry.trigger == Trigger::Edge {
                revents &= !previous;
            }
            if revents != 0 {
                fired += 1;
                f(p.fd, Ready::from_revents(revents), &mut entry.data);
            }
        }
        Ok(fired)
    }
}

/// `poll(2)` timeout for `timeout`. Partial milliseconds round up, so a
/// short nonzero wait never turns into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int,
        None => -1,
    }
}
