use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::channel::{Channel, ChannelHandlers};
use crate::reactor::EventLoop;
use crate::timer::{Timer, TimerCallback, TimerId, Timers};
use crate::utils::LoopCell;

const MIN_TIMER_DELAY: Duration = Duration::from_micros(100);

/// Monotonic `timerfd`, non-blocking and close-on-exec.
pub(crate) struct TimerFd {
    file: File,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, the result is checked below.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self { file })
    }

    /// Arms the descriptor to fire once at `when`, never sooner than 100µs
    /// from now.
    pub(crate) fn arm(&self, when: Instant) -> io::Result<()> {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(MIN_TIMER_DELAY);
        self.settime(delay)
    }

    fn settime(&self, delay: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        // SAFETY: `spec` lives across the call and the old value is not requested.
        let ret = unsafe {
            libc::timerfd_settime(self.file.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Consumes the expiration count.
    pub(crate) fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.file).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Timers of one event loop, multiplexed over a single `timerfd`.
///
/// Adding and cancelling is allowed from any thread; both hop onto the
/// loop thread before touching the timer set. Expired callbacks run on the
/// loop thread, in expiration order.
pub struct TimerQueue {
    timerfd: TimerFd,
    channel: Arc<Channel>,
    timers: LoopCell<Timers>,
}

impl TimerQueue {
    pub(crate) fn new(timerfd: TimerFd, event_loop: Weak<EventLoop>, owner: ThreadId) -> Arc<Self> {
        Arc::new_cyclic(|queue: &Weak<TimerQueue>| {
            let queue = queue.clone();
            let handlers = ChannelHandlers::new().on_read(move |receive_time| {
                if let Some(queue) = queue.upgrade() {
                    queue.handle_read(receive_time);
                }
            });
            let channel = Channel::with_owner(event_loop, owner, timerfd.as_raw_fd(), handlers);
            Self {
                timerfd,
                channel,
                timers: LoopCell::new(owner, Timers::default()),
            }
        })
    }

    /// Starts watching the timer descriptor. Runs once, on the loop thread,
    /// after the owning loop is fully built.
    pub(crate) fn start(&self) {
        self.channel.enable_reading();
    }

    pub(crate) fn add_timer(
        self: &Arc<Self>,
        event_loop: &EventLoop,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Timer::new(callback, when, interval);
        let id = timer.id();
        let queue = Arc::clone(self);
        event_loop.run_in_loop(move || queue.add_timer_in_loop(timer));
        id
    }

    pub(crate) fn cancel(self: &Arc<Self>, event_loop: &EventLoop, id: TimerId) {
        let queue = Arc::clone(self);
        event_loop.run_in_loop(move || queue.cancel_in_loop(id));
    }

    /// Number of timers waiting to expire.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    fn add_timer_in_loop(&self, timer: Timer) {
        let when = timer.expiration();
        trace!(timer = %timer.id(), "add timer");
        let earliest_changed = self.timers.borrow_mut().insert(timer);
        if earliest_changed {
            self.rearm(when);
        }
    }

    fn cancel_in_loop(&self, id: TimerId) {
        trace!(timer = %id, "cancel timer");
        self.timers.borrow_mut().cancel(id);
    }

    fn rearm(&self, when: Instant) {
        if let Err(e) = self.timerfd.arm(when) {
            error!(fd = self.timerfd.as_raw_fd(), error = %e, "timerfd_settime failed");
        }
    }

    /// Runs every timer due at `now`, the instant the loop's poll returned,
    /// so all timers of one pass agree on the current time.
    pub(crate) fn handle_read(&self, now: Instant) {
        match self.timerfd.read() {
            Ok(howmany) => trace!(howmany, "timer queue woke up"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!(error = %e, "failed to read timerfd"),
        }

        let mut expired = self.timers.borrow_mut().take_expired(now);
        for timer in expired.iter_mut() {
            let cancelled = self.timers.borrow().was_cancelled(timer.id());
            if !cancelled {
                timer.run();
            }
        }
        let next = self.timers.borrow_mut().reset(expired, now);
        if let Some(when) = next {
            self.rearm(when);
        }
    }
}
