//! Deadline enforcement for long-running index builds.
//!
//! A [`Watchdog`] arms a background thread that interrupts the connection's
//! running statement once the timeout passes. Dropping the watchdog wakes the
//! thread immediately and joins it, so no interrupt can fire after the build
//! step it guards has finished.

use rusqlite::InterruptHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub struct Watchdog {
    stop_signal: Arc<(Mutex<bool>, Condvar)>,
    fired: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    /// Interrupt `interrupt`'s connection if still running after `timeout`.
    pub fn arm(interrupt: InterruptHandle, timeout: Duration) -> Self {
        let stop_signal = Arc::new((Mutex::new(false), Condvar::new()));
        let fired = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let fired_clone = Arc::clone(&fired);

        let handle = thread::spawn(move || {
            let (lock, cvar) = &*stop_signal_clone;
            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            // Loop guards against spurious wakeups.
            let (stopped, result) = cvar
                .wait_timeout_while(guard, timeout, |stop| !*stop)
                .unwrap_or_else(PoisonError::into_inner);
            if result.timed_out() && !*stopped {
                fired_clone.store(true, Ordering::SeqCst);
                interrupt.interrupt();
            }
        });

        Self {
            stop_signal,
            fired,
            handle: Some(handle),
        }
    }

    /// Whether the deadline passed and the interrupt was sent.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.stop_signal;
        {
            let mut stop = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *stop = true;
        }
        cvar.notify_one();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
