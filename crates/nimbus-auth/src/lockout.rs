//! Process-local login lockout.
//!
//! Failures are counted per email. Once the count reaches the threshold the
//! email is locked for the window; a successful login clears both. State is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Duration;
use nimbus_state::Timestamp;

#[derive(Debug, Default)]
struct Entry {
    failures: u32,
    locked_until: Option<Timestamp>,
}

#[derive(Debug)]
pub struct LockoutTracker {
    threshold: u32,
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockoutTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The instant the lock lifts, if `email` is locked at `now`.
    pub fn locked_until(&self, email: &str, now: Timestamp) -> Option<Timestamp> {
        let entries = self.entries.lock().expect("lockout lock");
        entries
            .get(email)
            .and_then(|e| e.locked_until)
            .filter(|until| now < *until)
    }

    /// Count a failure. Returns `true` if this failure locked the email.
    pub fn record_failure(&self, email: &str, now: Timestamp) -> bool {
        let mut entries = self.entries.lock().expect("lockout lock");
        let entry = entries.entry(email.to_string()).or_default();
        entry.failures += 1;
        if entry.failures >= self.threshold {
            entry.locked_until = Some(now + self.window);
            true
        } else {
            false
        }
    }

    pub fn reset(&self, email: &str) {
        self.entries.lock().expect("lockout lock").remove(email);
    }

    pub fn failures(&self, email: &str) -> u32 {
        self.entries
            .lock()
            .expect("lockout lock")
            .get(email)
            .map_or(0, |e| e.failures)
    }
}
