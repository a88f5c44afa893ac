//! Concurrent-user admission.
//!
//! The daemon serves a small lab; a fixed number of distinct users may be
//! active at once. A user counts as active until they have been idle longer
//! than the timeout. Existing users are always re-admitted.
//!
//! [`SessionTracker`] is an owned component; the daemon holds one and runs a
//! [`SessionReaper`] against it for periodic eviction.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionLimit {
    pub active_users: usize,
    pub max_users: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_users: usize,
    pub max_users: usize,
    pub idle_timeout_secs: i64,
}

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    last_activity: DateTime<Utc>,
    last_heartbeat: Option<DateTime<Utc>>,
}

pub struct SessionTracker {
    max_users: usize,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTracker {
    pub fn new(max_users: usize, idle_timeout: Duration) -> Self {
        Self {
            max_users: max_users.max(1),
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Records activity for `user_id`, admitting them if there is room.
    pub fn track(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), SessionLimit> {
        let mut sessions = self.lock();
        evict_idle_locked(&mut sessions, now, self.idle_timeout);

        if let Some(entry) = sessions.get_mut(user_id) {
            entry.last_activity = now;
            return Ok(());
        }

        if sessions.len() >= self.max_users {
            return Err(SessionLimit {
                active_users: sessions.len(),
                max_users: self.max_users,
            });
        }

        sessions.insert(
            user_id.to_string(),
            SessionEntry {
                last_activity: now,
                last_heartbeat: None,
            },
        );
        Ok(())
    }

    /// Keep-alive from a connected client. Counts as activity; unknown users
    /// go through admission like any other request.
    pub fn heartbeat(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), SessionLimit> {
        self.track(user_id, now)?;
        if let Some(entry) = self.lock().get_mut(user_id) {
            entry.last_heartbeat = Some(now);
        }
        Ok(())
    }

    pub fn last_heartbeat(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .get(user_id)
            .and_then(|entry| entry.last_heartbeat)
    }

    /// True while a new user could still be admitted.
    pub fn is_within_limit(&self, now: DateTime<Utc>) -> bool {
        let mut sessions = self.lock();
        evict_idle_locked(&mut sessions, now, self.idle_timeout);
        sessions.len() < self.max_users
    }

    /// Drops users idle past the timeout. Returns how many were removed.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.lock();
        evict_idle_locked(&mut sessions, now, self.idle_timeout)
    }

    pub fn remove(&self, user_id: &str) -> bool {
        self.lock().remove(user_id).is_some()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> SessionStats {
        let mut sessions = self.lock();
        evict_idle_locked(&mut sessions, now, self.idle_timeout);
        SessionStats {
            active_users: sessions.len(),
            max_users: self.max_users,
            idle_timeout_secs: self.idle_timeout.num_seconds(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        // The map holds no invariants a panicking holder could break.
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn evict_idle_locked(
    sessions: &mut HashMap<String, SessionEntry>,
    now: DateTime<Utc>,
    idle_timeout: Duration,
) -> usize {
    let before = sessions.len();
    sessions.retain(|_, entry| now.signed_duration_since(entry.last_activity) <= idle_timeout);
    let evicted = before - sessions.len();
    if evicted > 0 {
        tracing::info!(evicted, remaining = sessions.len(), "Evicted idle user sessions");
    }
    evicted
}

/// Background eviction for a [`SessionTracker`]. Stops on [`SessionReaper::stop`]
/// or when dropped.
pub struct SessionReaper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionReaper {
    pub fn start(tracker: Arc<SessionTracker>, interval: std::time::Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    tracker.evict_idle(Utc::now());
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Session reaper thread panicked");
            }
        }
    }
}

impl Drop for SessionReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
