//! A shared periodic tick, dispatched to a registry of subscribers from one thread

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

pub trait TickSubscriber: Send + Sync {
    fn tick(&self, now: Instant);
}

struct TickerState {
    subscribers: FxHashMap<u64, Arc<dyn TickSubscriber>>,
    stopped: bool,
}

pub struct Ticker {
    interval: Duration,
    next_id: AtomicU64,
    state: Mutex<TickerState>,
    stop_signal: Condvar,
}

impl Ticker {
    /// Creates a ticker and starts its thread. The thread runs until [Ticker::stop].
    pub fn start(interval: Duration) -> std::io::Result<Arc<Ticker>> {
        let ticker = Arc::new(Ticker {
            interval,
            next_id: AtomicU64::new(1),
            state: Mutex::new(TickerState {
                subscribers: FxHashMap::default(),
                stopped: false,
            }),
            stop_signal: Condvar::new(),
        });

        let t = ticker.clone();
        thread::Builder::new()
            .name("ticker".to_string())
            .spawn(move || t.run())?;
        Ok(ticker)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the id for [Ticker::unsubscribe]
    pub fn subscribe(&self, subscriber: Arc<dyn TickSubscriber>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().subscribers.insert(id, subscriber);
        trace!("tick subscriber {} added", id);
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
        trace!("tick subscriber {} removed", id);
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.subscribers.clear();
        self.stop_signal.notify_all();
    }

    fn run(&self) {
        debug!("ticker started with interval {:?}", self.interval);
        let mut next = Instant::now() + self.interval;
        loop {
            let subscribers: Vec<Arc<dyn TickSubscriber>> = {
                let mut state = self.state.lock();
                while !state.stopped && Instant::now() < next {
                    self.stop_signal.wait_until(&mut state, next);
                }
                if state.stopped {
                    break;
                }
                state.subscribers.values().cloned().collect()
            };

            let now = Instant::now();
            for s in subscribers {
                s.tick(now);
            }

            next += self.interval;
            if next < now {
                // a slow subscriber made us skip ticks
                next = now + self.interval;
            }
        }
        debug!("ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl TickSubscriber for Counter {
        fn tick(&self, _now: Instant) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait_for(f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_ticks_subscribers() {
        let ticker = Ticker::start(Duration::from_millis(5)).unwrap();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        ticker.subscribe(a.clone());
        ticker.subscribe(b.clone());

        assert!(wait_for(|| a.0.load(Ordering::Relaxed) >= 3 && b.0.load(Ordering::Relaxed) >= 3));
        ticker.stop();
    }

    #[test]
    fn test_unsubscribe() {
        let ticker = Ticker::start(Duration::from_millis(5)).unwrap();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let id = ticker.subscribe(a.clone());
        assert!(wait_for(|| a.0.load(Ordering::Relaxed) >= 1));

        ticker.unsubscribe(id);
        // a tick that was already dispatching may still arrive
        thread::sleep(Duration::from_millis(20));
        let count = a.0.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(a.0.load(Ordering::Relaxed), count);
        ticker.stop();
    }

    #[test]
    fn test_stop_clears_subscribers() {
        let ticker = Ticker::start(Duration::from_millis(5)).unwrap();
        ticker.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        ticker.stop();
        assert!(ticker.state.lock().subscribers.is_empty());
    }
}
