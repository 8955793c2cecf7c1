use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::{Channel, PollState};
use crate::error::{Error, Result};
use crate::poll::{MioPoller, Poller, Wakeup, DEFAULT_EVENTS_CAPACITY};
use crate::timer::TimerId;
use crate::timer_queue::{TimerFd, TimerQueue};
use crate::utils::LoopCell;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub type Functor = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// Tuning knobs for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Upper bound on one blocking wait.
    pub poll_timeout: Duration,
    /// Initial size of the ready-event list; doubled whenever a wait fills it.
    pub events_capacity: usize,
    /// Bound checked by [`EventLoop::try_queue_in_loop`]. `None` is unbounded.
    pub max_pending: Option<usize>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            max_pending: None,
        }
    }
}

impl EventLoopConfig {
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }
}

/// One reactor bound to the thread that created it.
///
/// Each iteration waits on the poller, runs the handlers of every ready
/// channel, then runs the tasks queued from other threads. All channel,
/// poller and timer state is touched only from the owning thread; the
/// cross-thread entry points are [`quit`](Self::quit),
/// [`run_in_loop`](Self::run_in_loop), [`queue_in_loop`](Self::queue_in_loop)
/// and the timer methods.
///
/// A thread may own at most one live loop. Creating a second one panics.
///
/// ```rust,no_run
/// use mill_reactor::EventLoop;
/// use std::time::Duration;
///
/// let event_loop = EventLoop::new()?;
/// let handle = event_loop.clone();
/// event_loop.run_after(Duration::from_secs(1), move || handle.quit());
/// event_loop.run();
/// # Ok::<(), mill_reactor::Error>(())
/// ```
pub struct EventLoop {
    thread_id: ThreadId,
    config: EventLoopConfig,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_functors: AtomicBool,
    iteration: AtomicU64,
    poll_return_time: Mutex<Instant>,
    poller: LoopCell<Box<dyn Poller>>,
    wakeup: Box<dyn Wakeup>,
    pending_functors: Mutex<Vec<Functor>>,
    timer_queue: Arc<TimerQueue>,
    context: LoopCell<Option<Box<dyn Any + Send>>>,
}

impl EventLoop {
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<Arc<Self>> {
        let thread_id = thread::current().id();
        CURRENT_LOOP.with(|current| {
            if current.borrow().upgrade().is_some() {
                panic!("another EventLoop already exists in thread {thread_id:?}");
            }
        });

        let poller: Box<dyn Poller> = Box::new(MioPoller::new(config.events_capacity)?);
        let wakeup = poller.wakeup_handle()?;
        let timerfd = TimerFd::new()?;

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread_id,
            config,
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_time: Mutex::new(Instant::now()),
            poller: LoopCell::new(thread_id, poller),
            wakeup,
            pending_functors: Mutex::new(Vec::new()),
            timer_queue: TimerQueue::new(timerfd, weak.clone(), thread_id),
            context: LoopCell::new(thread_id, None),
        });
        event_loop.timer_queue.start();

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Arc::downgrade(&event_loop));
        debug!(thread = ?thread_id, "EventLoop created");
        Ok(event_loop)
    }

    /// The loop owned by the calling thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    /// Runs until [`quit`](Self::quit) is observed. Must be called on the
    /// owning thread, and not reentrantly.
    pub fn run(&self) {
        assert!(
            !self.looping.load(Ordering::Acquire),
            "EventLoop::run called while already looping"
        );
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        trace!("EventLoop start looping");

        let mut active_channels: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let now = self
                .poller
                .borrow_mut()
                .poll(Some(self.config.poll_timeout), &mut active_channels);
            *self.poll_return_time.lock() = now;
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Release);
            for channel in &active_channels {
                // Removed by an earlier handler of this batch.
                if channel.poll_state() == PollState::New {
                    continue;
                }
                channel.handle_event(now);
            }
            self.event_handling.store(false, Ordering::Release);
            active_channels.clear();

            self.do_pending_functors();
        }

        trace!("EventLoop stop looping");
        // A quit is consumed by the run it stopped.
        self.quit.store(false, Ordering::Release);
        self.looping.store(false, Ordering::Release);
    }

    /// Asks the loop to stop after the current iteration. Safe from any
    /// thread; a request made before [`run`](Self::run) starts is honored.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `cb` now when called on the loop thread, otherwise queues it.
    pub fn run_in_loop<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            cb();
        } else {
            self.queue_in_loop(cb);
        }
    }

    /// Queues `cb` to run on the loop thread after the current batch of
    /// events. Tasks run in submission order.
    pub fn queue_in_loop<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_functors.lock().push(Box::new(cb));
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Like [`queue_in_loop`](Self::queue_in_loop), but refuses the task when
    /// the configured bound on pending tasks is reached.
    pub fn try_queue_in_loop<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.pending_functors.lock();
            if let Some(max) = self.config.max_pending {
                if pending.len() >= max {
                    return Err(Error::QueueFull(pending.len()));
                }
            }
            pending.push(Box::new(cb));
        }
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
        Ok(())
    }

    /// Number of queued tasks not yet run.
    pub fn queue_size(&self) -> usize {
        self.pending_functors.lock().len()
    }

    /// Runs `cb` at `time` on the loop thread.
    pub fn run_at<F>(&self, time: Instant, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue.add_timer(self, Box::new(cb), time, None)
    }

    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Runs `cb` every `interval`, first after one interval. Each run is
    /// rescheduled relative to when the batch it ran in expired.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue
            .add_timer(self, Box::new(cb), Instant::now() + interval, Some(interval))
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.timer_queue.cancel(self, timer_id);
    }

    pub(crate) fn wakeup(&self) {
        if let Err(e) = self.wakeup.wake() {
            error!(error = %e, "EventLoop::wakeup failed");
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.belongs_to(self), "channel fd={} belongs to another loop", channel.fd());
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.belongs_to(self), "channel fd={} belongs to another loop", channel.fd());
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        assert!(channel.belongs_to(self), "channel fd={} belongs to another loop", channel.fd());
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            self.abort_not_in_loop_thread();
        }
    }

    fn abort_not_in_loop_thread(&self) -> ! {
        panic!(
            "EventLoop was created in thread {:?}, current thread is {:?}",
            self.thread_id,
            thread::current().id()
        );
    }

    /// Attaches application state to this loop, replacing any previous value.
    /// Loop thread only.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.borrow_mut() = Some(Box::new(value));
    }

    /// A copy of the loop's context, if one of type `T` is attached.
    /// Loop thread only.
    pub fn context<T: Any + Clone>(&self) -> Option<T> {
        self.context
            .borrow()
            .as_ref()
            .and_then(|ctx| ctx.downcast_ref::<T>())
            .cloned()
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.borrow_mut().take()
    }

    /// Number of completed poll waits.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock()
    }

    pub fn event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    fn do_pending_functors(&self) {
        let functors = std::mem::take(&mut *self.pending_functors.lock());
        self.calling_pending_functors.store(true, Ordering::Release);
        for functor in functors {
            functor();
        }
        self.calling_pending_functors.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(thread = ?self.thread_id, "EventLoop destroyed");
    }
}
