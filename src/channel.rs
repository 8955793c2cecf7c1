//! Binding between one file descriptor, its interest mask and the handlers
//! that run when the descriptor becomes ready.
//!
//! A channel never owns its descriptor. The owner (a connection, the
//! acceptor, the connector, the timer queue) closes the descriptor, and
//! only after the channel has been detached with [`Channel::remove`].

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Instant;

use tracing::{trace, warn};

use crate::event::Ready;
use crate::reactor::EventLoop;
use crate::utils::LoopCell;

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ReadEventCallback = Arc<dyn Fn(Instant) + Send + Sync>;

/// Where a channel stands with respect to its poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Unknown to the poller.
    New,
    /// Registered with the OS multiplexer.
    Added,
    /// Known to the poller but unregistered from the OS multiplexer.
    Deleted,
}

/// Handlers fixed at channel construction.
#[derive(Default, Clone)]
pub struct ChannelHandlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

impl ChannelHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.read = Some(Arc::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }
}

struct ChannelState {
    interest: Ready,
    revents: Ready,
    poll_state: PollState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    log_hup: bool,
    event_handling: bool,
    added_to_loop: bool,
}

pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    handlers: ChannelHandlers,
    state: LoopCell<ChannelState>,
}

impl Channel {
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd, handlers: ChannelHandlers) -> Arc<Self> {
        Self::with_owner(Arc::downgrade(event_loop), event_loop.thread_id(), fd, handlers)
    }

    pub(crate) fn with_owner(
        event_loop: Weak<EventLoop>,
        owner: ThreadId,
        fd: RawFd,
        handlers: ChannelHandlers,
    ) -> Arc<Self> {
        Arc::new(Self {
            event_loop,
            fd,
            handlers,
            state: LoopCell::new(
                owner,
                ChannelState {
                    interest: Ready::NONE,
                    revents: Ready::NONE,
                    poll_state: PollState::New,
                    tie: None,
                    log_hup: true,
                    event_handling: false,
                    added_to_loop: false,
                },
            ),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.upgrade()
    }

    pub(crate) fn belongs_to(&self, event_loop: &EventLoop) -> bool {
        std::ptr::eq(self.event_loop.as_ptr(), event_loop)
    }

    pub fn interest(&self) -> Ready {
        self.state.borrow().interest
    }

    pub fn revents(&self) -> Ready {
        self.state.borrow().revents
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.state.borrow_mut().revents = revents;
    }

    pub(crate) fn poll_state(&self) -> PollState {
        self.state.borrow().poll_state
    }

    pub(crate) fn set_poll_state(&self, poll_state: PollState) {
        self.state.borrow_mut().poll_state = poll_state;
    }

    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn is_added_to_loop(&self) -> bool {
        self.state.borrow().added_to_loop
    }

    pub fn is_event_handling(&self) -> bool {
        self.state.borrow().event_handling
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.state.borrow_mut().interest |= Ready::READABLE;
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            state.interest = state.interest & !Ready::READABLE;
        }
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.state.borrow_mut().interest |= Ready::WRITABLE;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            state.interest = state.interest & !Ready::WRITABLE;
        }
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.borrow_mut().interest = Ready::NONE;
        self.update();
    }

    /// Ties the channel to the lifetime of `owner`: once `owner` is gone,
    /// events for this channel are ignored.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.state.borrow_mut().tie = Some(Arc::downgrade(owner));
    }

    pub fn set_log_hup(&self, on: bool) {
        self.state.borrow_mut().log_hup = on;
    }

    /// Detaches the channel from its loop. The interest mask must already
    /// be empty.
    pub fn remove(self: &Arc<Self>) {
        assert!(
            self.is_none_event(),
            "channel fd={} removed with interest {}",
            self.fd,
            self.interest()
        );
        self.state.borrow_mut().added_to_loop = false;
        self.event_loop().remove_channel(self);
    }

    fn update(self: &Arc<Self>) {
        self.state.borrow_mut().added_to_loop = true;
        self.event_loop().update_channel(self);
    }

    fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop
            .upgrade()
            .expect("channel used after its event loop was dropped")
    }

    /// Runs the handlers matching the last reported readiness. Only the
    /// owning loop calls this, during dispatch.
    pub fn handle_event(self: &Arc<Self>, receive_time: Instant) {
        let tie = self.state.borrow().tie.clone();
        match tie {
            Some(tie) => {
                if let Some(_guard) = tie.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let (revents, log_hup) = {
            let mut state = self.state.borrow_mut();
            state.event_handling = true;
            (state.revents, state.log_hup)
        };
        trace!(fd = self.fd, revents = %revents, "handle event");

        let hung_up = revents.contains(Ready::HUP) && !revents.is_readable();
        if hung_up {
            if log_hup {
                warn!(fd = self.fd, "channel hang up");
            }
            if let Some(cb) = &self.handlers.close {
                cb();
            }
        }
        if revents.contains(Ready::ERROR) {
            if let Some(cb) = &self.handlers.error {
                cb();
            }
        }
        if !hung_up && revents.intersects(Ready::READABLE | Ready::PRIORITY | Ready::READ_CLOSED) {
            if let Some(cb) = &self.handlers.read {
                cb(receive_time);
            }
        }
        if revents.is_writable() {
            if let Some(cb) = &self.handlers.write {
                cb();
            }
        }
        self.state.borrow_mut().event_handling = false;
    }
}
