//! Process watchdog.
//!
//! A dedicated thread supervises every host peer from creation until its
//! client process goes away:
//!
//! ```text
//! add_process_host ──> Unconnected ──mark_connected──> Connected ──exit──> removed
//!                           │
//!                           └──────────── expire_at passed ──────────> removed
//! ```
//!
//! The tracked sets are the only state shared between the control thread and
//! the watchdog thread, guarded by one mutex. The watchdog never touches a
//! peer itself: it reports `WatchdogEvent`s and the control thread tears the
//! peer down.
//!
//! Connected processes are polled once per `poll_interval` rather than waited
//! on, so a process exit is reported at most one poll interval (plus the time
//! to take the lock) after it happens. Connect deadlines are not bound by the
//! poll interval: the thread sleeps exactly until the next one.

use crate::config::WatchdogConfig;
use crate::ipc::PeerId;
use crate::platform::ProcessHandle;
use crate::{LinkError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Something the control thread must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// The peer never completed its handshake in time.
    ConnectTimeout(PeerId),
    /// The connected peer's process exited.
    ProcessExited { peer: PeerId, pid: u32 },
}

/// Where a peer currently is in the watchdog's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedState {
    Unconnected,
    Connected,
}

#[derive(Default)]
struct Tracked {
    unconnected: HashMap<PeerId, Instant>,
    connected: HashMap<PeerId, Box<dyn ProcessHandle>>,
    shutting_down: bool,
}

struct Shared {
    tracked: Mutex<Tracked>,
    wakeup: Condvar,
}

/// Handle to the watchdog thread. Dropping it shuts the thread down.
pub struct ProcessWatchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessWatchdog {
    /// Start the watchdog thread. Connected processes are polled every
    /// `poll_interval`.
    pub fn start(
        poll_interval: Duration,
        events: mpsc::UnboundedSender<WatchdogEvent>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            tracked: Mutex::new(Tracked::default()),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(WatchdogConfig::THREAD_NAME.to_string())
            .spawn(move || supervise(thread_shared, poll_interval, events))
            .map_err(|e| LinkError::io_with_context(e, "Failed to spawn watchdog thread"))?;

        debug!("Process watchdog started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tracked>> {
        self.shared
            .tracked
            .lock()
            .map_err(|_| LinkError::Other("Failed to acquire watchdog lock".to_string()))
    }

    /// Start supervising a peer that has not connected yet. It expires after
    /// `timeout` unless `mark_connected` is called first.
    pub fn add_process_host(&self, peer: PeerId, timeout: Duration) -> Result<()> {
        let mut tracked = self.lock()?;
        if tracked.shutting_down {
            return Err(LinkError::WatchdogShutDown);
        }
        tracked.unconnected.insert(peer, Instant::now() + timeout);
        drop(tracked);

        debug!("Watching {} (connect timeout {:?})", peer, timeout);
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Move a peer from unconnected to connected.
    ///
    /// Returns false if the peer is not waiting for its handshake, for example
    /// because it already timed out; the caller then expects its
    /// `ConnectTimeout` event.
    pub fn mark_connected(&self, peer: PeerId, handle: Box<dyn ProcessHandle>) -> Result<bool> {
        let mut tracked = self.lock()?;
        if tracked.shutting_down || tracked.unconnected.remove(&peer).is_none() {
            return Ok(false);
        }
        debug!("{} connected (pid {})", peer, handle.pid());
        tracked.connected.insert(peer, handle);
        drop(tracked);

        self.shared.wakeup.notify_all();
        Ok(true)
    }

    /// Stop supervising a peer that was torn down for another reason.
    pub fn forget(&self, peer: PeerId) -> Result<()> {
        let mut tracked = self.lock()?;
        tracked.unconnected.remove(&peer);
        tracked.connected.remove(&peer);
        Ok(())
    }

    pub fn state_of(&self, peer: PeerId) -> Result<Option<TrackedState>> {
        let tracked = self.lock()?;
        let state = if tracked.unconnected.contains_key(&peer) {
            Some(TrackedState::Unconnected)
        } else if tracked.connected.contains_key(&peer) {
            Some(TrackedState::Connected)
        } else {
            None
        };
        Ok(state)
    }

    /// Stop the thread and return every peer that was still tracked.
    ///
    /// No entries can be added once shutdown has begun.
    pub fn shutdown(&mut self) -> Vec<PeerId> {
        let Some(thread) = self.thread.take() else {
            return Vec::new();
        };

        let remaining = match self.shared.tracked.lock() {
            Ok(mut guard) => {
                let tracked = &mut *guard;
                tracked.shutting_down = true;
                let mut peers: Vec<PeerId> = tracked
                    .unconnected
                    .drain()
                    .map(|(peer, _)| peer)
                    .chain(tracked.connected.drain().map(|(peer, _)| peer))
                    .collect();
                peers.sort();
                peers
            }
            Err(_) => {
                error!("Watchdog lock poisoned during shutdown");
                Vec::new()
            }
        };
        self.shared.wakeup.notify_all();

        if thread.join().is_err() {
            warn!("Watchdog thread panicked");
        }
        info!("Process watchdog stopped ({} peers still tracked)", remaining.len());
        remaining
    }
}

impl Drop for ProcessWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supervise(shared: Arc<Shared>, poll_interval: Duration, events: mpsc::UnboundedSender<WatchdogEvent>) {
    let Ok(mut tracked) = shared.tracked.lock() else {
        error!("Watchdog lock poisoned, supervision stopped");
        return;
    };

    loop {
        if tracked.shutting_down {
            return;
        }

        let now = Instant::now();

        let expired: Vec<PeerId> = tracked
            .unconnected
            .iter()
            .filter(|(_, expire_at)| **expire_at <= now)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            tracked.unconnected.remove(&peer);
            warn!("{} did not connect in time, tearing it down", peer);
            let _ = events.send(WatchdogEvent::ConnectTimeout(peer));
        }

        let exited: Vec<(PeerId, u32)> = tracked
            .connected
            .iter_mut()
            .filter_map(|(peer, handle)| handle.has_exited().then(|| (*peer, handle.pid())))
            .collect();
        for (peer, pid) in exited {
            tracked.connected.remove(&peer);
            info!("Process {} of {} exited", pid, peer);
            let _ = events.send(WatchdogEvent::ProcessExited { peer, pid });
        }

        let until_expiry = tracked
            .unconnected
            .values()
            .min()
            .map(|expire_at| expire_at.saturating_duration_since(now));
        let wait = match (until_expiry, tracked.connected.is_empty()) {
            (Some(expiry), true) => Some(expiry),
            (Some(expiry), false) => Some(expiry.min(poll_interval)),
            (None, false) => Some(poll_interval),
            (None, true) => None,
        };

        let woken = match wait {
            Some(timeout) => shared
                .wakeup
                .wait_timeout(tracked, timeout)
                .ok()
                .map(|(guard, _)| guard),
            None => shared.wakeup.wait(tracked).ok(),
        };
        tracked = match woken {
            Some(guard) => guard,
            None => {
                error!("Watchdog lock poisoned, supervision stopped");
                return;
            }
        };
    }
}
