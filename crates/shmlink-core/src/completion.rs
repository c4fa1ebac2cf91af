//! One-shot completion with a hard timeout (boot-complete, crash-ack).
//!
//! `complete_all` releases every current and future waiter until `reinit`.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{LinkError, Result};

#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete_all(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cv.notify_all();
    }

    pub fn reinit(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until completed or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration, what: &'static str) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::Timeout(what));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_times_out() {
        let c = Completion::new();
        let err = c.wait_timeout(Duration::from_millis(5), "boot").unwrap_err();
        assert_eq!(err, LinkError::Timeout("boot"));
    }

    #[test]
    fn test_complete_from_other_thread() {
        let c = Arc::new(Completion::new());
        let c2 = Arc::clone(&c);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            c2.complete_all();
        });
        c.wait_timeout(Duration::from_secs(5), "boot").unwrap();
        h.join().unwrap();
        // stays complete until reinit
        c.wait_timeout(Duration::ZERO, "boot").unwrap();
        c.reinit();
        assert!(!c.is_done());
    }
}
