mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{base_loop, init_tracing, wait_until, TIMEOUT};
use mill_reactor::{EventLoop, EventLoopConfig, EventLoopThread, EventLoopThreadPool};

#[test]
fn test_tasks_from_many_threads_keep_per_thread_order() {
    let (thread, event_loop) = base_loop("fifo");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let event_loop = Arc::clone(&event_loop);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for i in 0..500 {
                    let seen = Arc::clone(&seen);
                    event_loop.queue_in_loop(move || seen.lock().unwrap().push((p, i)));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(|| seen.lock().unwrap().len() == 2000));
    let seen = seen.lock().unwrap();
    for p in 0..4 {
        let order: Vec<_> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
        assert_eq!(order, (0..500).collect::<Vec<_>>());
    }
    drop(seen);
    drop(thread);
}

#[test]
fn test_tasks_run_on_the_loop_thread() {
    let (thread, event_loop) = base_loop("affinity");
    let (tx, rx) = mpsc::channel();
    let target = Arc::clone(&event_loop);
    event_loop.run_in_loop(move || {
        let current = EventLoop::current().expect("current loop");
        let _ = tx.send((target.is_in_loop_thread(), Arc::ptr_eq(&current, &target)));
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (true, true));
    assert!(!event_loop.is_in_loop_thread());
    drop(thread);
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let (thread, event_loop) = base_loop("timers");
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();

    for (label, ms) in [("c", 60u64), ("a", 20), ("b", 40)] {
        let tx = tx.clone();
        event_loop.run_at(start + Duration::from_millis(ms), move || {
            let _ = tx.send((label, Instant::now()));
        });
    }
    let cancelled = {
        let tx = tx.clone();
        event_loop.run_after(Duration::from_millis(30), move || {
            let _ = tx.send(("cancelled", Instant::now()));
        })
    };
    event_loop.cancel(cancelled);

    let fired: Vec<_> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    let labels: Vec<_> = fired.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, ["a", "b", "c"]);
    assert!(fired[0].1 >= start + Duration::from_millis(20));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    drop(thread);
}

#[test]
fn test_repeating_timer_until_cancelled() {
    let (thread, event_loop) = base_loop("ticker");
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 3));
    event_loop.cancel(id);
    // Let any in-flight cancel land before sampling.
    thread::sleep(Duration::from_millis(50));
    let after_cancel = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    drop(thread);
}

#[test]
fn test_quit_from_another_thread() {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::with_config(
            EventLoopConfig::default().poll_timeout(Duration::from_secs(30)),
        )
        .unwrap();
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
        event_loop.iteration()
    });

    let event_loop = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(wait_until(|| event_loop.is_looping()));
    let started = Instant::now();
    event_loop.quit();
    handle.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!event_loop.is_looping());
}

#[test]
fn test_thread_init_runs_before_tasks() {
    init_tracing();
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);
    let mut thread = EventLoopThread::new(
        "with-init",
        Some(Arc::new(move |_: &Arc<EventLoop>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let event_loop = thread.start_loop().unwrap();
    assert_eq!(inits.load(Ordering::SeqCst), 1);

    let (tx, rx) = mpsc::channel();
    event_loop.queue_in_loop(move || {
        let _ = tx.send(thread::current().name().map(str::to_owned));
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().as_deref(), Some("with-init"));
    drop(thread);
    assert!(!event_loop.is_looping());
}

#[test]
fn test_pool_spreads_over_distinct_threads() {
    let (thread, base) = base_loop("pool-base");
    let (tx, rx) = mpsc::channel();
    let base_clone = Arc::clone(&base);
    base.run_in_loop(move || {
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base_clone), "pool-io");
        pool.set_thread_num(3);
        pool.start(None).unwrap();
        let ids: Vec<_> = (0..6).map(|_| pool.next_loop().thread_id()).collect();
        let _ = tx.send(ids);
    });

    let ids = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(ids[0..3], ids[3..6]);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert!(ids.iter().all(|id| *id != base.thread_id()));
    drop(thread);
}
