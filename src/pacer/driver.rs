//! Refresh driver: a thread standing in for the display's refresh callback.
//!
//! Ticks at the pacer's `target_fps` and calls [`FramePacer::on_refresh`] with the
//! time since the driver started. Between ticks the thread is parked, so dropping
//! the driver wakes it immediately instead of waiting out the interval.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::FramePacer;

pub struct RefreshDriver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshDriver {
    /// Spawn the driver thread for a shared pacer.
    pub fn spawn(pacer: Arc<Mutex<FramePacer>>) -> io::Result<Self> {
        let interval = Duration::from_secs_f64(pacer.lock().config().frame_interval());
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = running.clone();

        let handle = thread::Builder::new()
            .name("frameport-refresh".to_string())
            .spawn(move || Self::tick_loop(pacer, interval, running_for_thread))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn tick_loop(pacer: Arc<Mutex<FramePacer>>, interval: Duration, running: Arc<AtomicBool>) {
        let origin = Instant::now();
        let mut next = origin + interval;

        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next {
                thread::park_timeout(next - now);
                continue;
            }

            let mut pacer = pacer.lock();
            if pacer.is_disposed() {
                break;
            }
            pacer.on_refresh(now.duration_since(origin));
            drop(pacer);

            // Missed ticks are skipped, not replayed.
            next += interval;
            if next < now {
                next = now + interval;
            }
        }
        tracing::debug!("refresh driver exiting");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RefreshDriver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}
