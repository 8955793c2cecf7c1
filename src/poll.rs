use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{debug, error, trace};

use crate::channel::{Channel, PollState};
use crate::event::Ready;

/// Token reserved for the loop's wakeup descriptor. Channel tokens are file
/// descriptors and never reach this value.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

pub const DEFAULT_EVENTS_CAPACITY: usize = 16;

/// Interrupts a blocked [`Poller::poll`] from any thread.
pub trait Wakeup: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl Wakeup for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

/// I/O multiplexer owned by one event loop.
///
/// Keeps the fd to channel map and the registration state of every channel
/// it knows about. Only the owning loop thread calls into it.
pub trait Poller: Send {
    /// Waits for readiness, pushes every ready channel into `active` with its
    /// ready mask filled in, and returns the time the wait ended.
    fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Reconciles the OS registration with the channel's interest mask.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forgets the channel. Its interest mask must be empty.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Arc<Channel>) -> bool;

    /// Creates the handle used to interrupt [`poll`](Poller::poll).
    fn wakeup_handle(&self) -> io::Result<Box<dyn Wakeup>>;
}

/// [`Poller`] over `mio::Poll` (epoll on Linux).
///
/// mio registrations are edge-triggered; every handler reached from here
/// drains its descriptor until `WouldBlock`.
pub struct MioPoller {
    poll: Poll,
    events: Events,
    capacity: usize,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl MioPoller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            capacity,
            channels: HashMap::new(),
        })
    }

    fn register(&self, fd: RawFd, interest: mio::Interest) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            panic!("failed to register fd={fd} with the poller: {e}");
        }
    }

    fn reregister(&self, fd: RawFd, interest: mio::Interest) {
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            panic!("failed to modify fd={fd} in the poller: {e}");
        }
    }

    fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            error!(fd, error = %e, "failed to deregister fd");
        }
    }
}

impl Poller for MioPoller {
    fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> Instant {
        let result = self.poll.poll(&mut self.events, timeout);
        let now = Instant::now();
        match result {
            Ok(()) => {
                let mut num_events = 0;
                for event in self.events.iter() {
                    num_events += 1;
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let fd = event.token().0 as RawFd;
                    match self.channels.get(&fd).and_then(Weak::upgrade) {
                        Some(channel) => {
                            channel.set_revents(Ready::from(event));
                            active.push(channel);
                        }
                        None => trace!(fd, "event for unknown channel"),
                    }
                }
                if num_events == 0 {
                    trace!("nothing happened");
                } else {
                    trace!(num_events, "events happened");
                }
                if num_events == self.capacity {
                    self.capacity *= 2;
                    self.events = Events::with_capacity(self.capacity);
                    debug!(capacity = self.capacity, "grew poller event list");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(error = %e, "poll failed"),
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let state = channel.poll_state();
        let interest = channel.interest();
        trace!(fd, interest = %interest, ?state, "update channel");
        match state {
            PollState::New | PollState::Deleted => {
                if state == PollState::New {
                    // A stale entry is left behind when an owner closed its fd
                    // without removing the channel first.
                    assert!(
                        self.channels.get(&fd).map_or(true, |mapped| mapped.strong_count() == 0),
                        "fd={fd} already has a live channel in this poller"
                    );
                    self.channels.insert(fd, Arc::downgrade(channel));
                } else {
                    assert!(self.has_channel(channel), "deleted channel fd={fd} is not mapped");
                }
                match interest.to_interest() {
                    Some(interest) => {
                        self.register(fd, interest);
                        channel.set_poll_state(PollState::Added);
                    }
                    None => channel.set_poll_state(PollState::Deleted),
                }
            }
            PollState::Added => {
                assert!(self.has_channel(channel), "added channel fd={fd} is not mapped");
                match interest.to_interest() {
                    Some(interest) => self.reregister(fd, interest),
                    None => {
                        self.deregister(fd);
                        channel.set_poll_state(PollState::Deleted);
                    }
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        assert!(self.has_channel(channel), "removing unknown channel fd={fd}");
        assert!(channel.is_none_event());
        let state = channel.poll_state();
        assert!(state == PollState::Added || state == PollState::Deleted);
        self.channels.remove(&fd);
        if state == PollState::Added {
            self.deregister(fd);
        }
        channel.set_poll_state(PollState::New);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|mapped| std::ptr::eq(mapped.as_ptr(), Arc::as_ptr(channel)))
    }

    fn wakeup_handle(&self) -> io::Result<Box<dyn Wakeup>> {
        Ok(Box::new(mio::Waker::new(self.poll.registry(), WAKE_TOKEN)?))
    }
}
