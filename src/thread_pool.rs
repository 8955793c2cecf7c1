use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{Builder, JoinHandle};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::reactor::{EventLoop, EventLoopConfig};

/// Runs on a freshly created loop, on its own thread, before it starts
/// looping.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// A named OS thread that owns and runs one [`EventLoop`].
///
/// Dropping the handle asks the loop to quit and joins the thread.
pub struct EventLoopThread {
    name: String,
    config: EventLoopConfig,
    init: Option<ThreadInitCallback>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        Self::with_config(name, EventLoopConfig::default(), init)
    }

    pub fn with_config(
        name: impl Into<String>,
        config: EventLoopConfig,
        init: Option<ThreadInitCallback>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            init,
            event_loop: None,
            thread: None,
        }
    }

    /// Spawns the thread and blocks until its loop exists.
    pub fn start_loop(&mut self) -> Result<Arc<EventLoop>> {
        assert!(self.thread.is_none(), "EventLoopThread {} already started", self.name);

        let (tx, rx) = mpsc::channel::<Result<Arc<EventLoop>>>();
        let config = self.config.clone();
        let init = self.init.clone();
        let thread = Builder::new().name(self.name.clone()).spawn(move || {
            let event_loop = match EventLoop::with_config(config) {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if let Some(init) = &init {
                init(&event_loop);
            }
            if tx.send(Ok(Arc::clone(&event_loop))).is_err() {
                return;
            }
            event_loop.run();
        })?;
        self.thread = Some(thread);

        let event_loop = rx.recv().map_err(|_| Error::EventLoopGone)??;
        debug!(name = %self.name, "event loop thread started");
        self.event_loop = Some(Arc::clone(&event_loop));
        Ok(event_loop)
    }

    pub fn event_loop(&self) -> Option<&Arc<EventLoop>> {
        self.event_loop.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = &self.event_loop {
            event_loop.quit();
            // Dropped by a task running on the loop itself; the loop exits on
            // its own once that task returns.
            if event_loop.is_in_loop_thread() {
                return;
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(name = %self.name, "event loop thread panicked");
            }
        }
    }
}

/// Fixed set of I/O loops owned by a base loop.
///
/// With zero threads every request is served by the base loop. Selection
/// happens on the base loop thread.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    started: bool,
    next: AtomicUsize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            num_threads: 0,
            started: false,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "thread count changed after start");
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<()> {
        assert!(!self.started, "EventLoopThreadPool {} already started", self.name);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            let event_loop = thread.start_loop()?;
            self.threads.push(thread);
            self.loops.push(event_loop);
        }
        if self.num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        debug!(name = %self.name, threads = self.num_threads, "event loop pool started");
        Ok(())
    }

    /// Round-robin over the I/O loops, or the base loop when there are none.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started, "EventLoopThreadPool {} not started", self.name);
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index])
    }

    /// The same loop for the same hash value.
    pub fn loop_for_hash(&self, hash: u64) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        Arc::clone(&self.loops[(hash % self.loops.len() as u64) as usize])
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started, "EventLoopThreadPool {} not started", self.name);
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
