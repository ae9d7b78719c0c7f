//! The host process's control plane.
//!
//! `HostContext` is the one object that owns the profile manager, the process
//! watchdog and every host peer. It is constructed once at startup and passed
//! explicitly to whatever drives it; there is no global lookup.
//!
//! Where the control loop runs is decided once from `ThreadMode`:
//!
//! - `ControlLoop::CallerThread`: the caller owns a `HostContext` and drives
//!   it with `run` or `process_next`.
//! - `ControlLoop::DedicatedThread`: `HostHandle::spawn` moves the context to
//!   its own thread with a current-thread runtime and hands back a handle
//!   that talks to it through commands.

use crate::channel_info::ChannelToken;
use crate::config::HostConfig;
use crate::ipc::{Channel, ChannelEvent, EventSink, HostPeer, HostServices, PeerId};
use crate::platform::OsProcessHandle;
use crate::profile::ProfileManager;
use crate::watchdog::{ProcessWatchdog, WatchdogEvent};
use crate::{LinkError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A freshly created host channel, waiting for its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHostChannel {
    pub peer_id: PeerId,
    /// Encoded `ChannelToken` to pass on the client's command line.
    pub channel_info: String,
}

/// Called when a client asks the host to clear its renderers' web cache.
pub type WebCacheHandler = Box<dyn FnMut() + Send>;

/// Owner of all host-side control plane state.
pub struct HostContext {
    config: HostConfig,
    profiles: ProfileManager,
    watchdog: ProcessWatchdog,
    peers: HashMap<PeerId, HostPeer>,
    next_peer_id: u64,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
    watchdog_rx: mpsc::UnboundedReceiver<WatchdogEvent>,
    web_cache_handler: Option<WebCacheHandler>,
    web_cache_clears: u64,
    shut_down: bool,
}

impl HostContext {
    /// Build the context and start the watchdog thread.
    pub fn new(config: HostConfig) -> Result<Self> {
        let (watchdog_tx, watchdog_rx) = mpsc::unbounded_channel();
        let watchdog = ProcessWatchdog::start(config.poll_interval, watchdog_tx)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!("Host control plane started ({} thread mode)", config.thread_mode);
        Ok(Self {
            config,
            profiles: ProfileManager::new(),
            watchdog,
            peers: HashMap::new(),
            next_peer_id: 1,
            events_tx,
            events_rx,
            watchdog_rx,
            web_cache_handler: None,
            web_cache_clears: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileManager {
        &self.profiles
    }

    pub fn profiles_mut(&mut self) -> &mut ProfileManager {
        &mut self.profiles
    }

    pub fn watchdog(&self) -> &ProcessWatchdog {
        &self.watchdog
    }

    pub fn peer(&self, id: PeerId) -> Option<&HostPeer> {
        self.peers.get(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Install the callback that clears the renderers' web cache.
    pub fn set_web_cache_handler(&mut self, handler: WebCacheHandler) {
        self.web_cache_handler = Some(handler);
    }

    /// Number of web cache clears requested by clients so far.
    pub fn web_cache_clear_count(&self) -> u64 {
        self.web_cache_clears
    }

    /// Send a peer's client the name of its in-process renderer channel.
    /// Returns false if the peer is gone or its channel is closed.
    pub fn set_channel_name(&self, peer_id: PeerId, channel_name: &str) -> bool {
        self.peers
            .get(&peer_id)
            .is_some_and(|peer| peer.set_channel_name(channel_name))
    }

    /// Create a host peer listening for one client and put it under watchdog
    /// supervision. The client must complete its handshake within `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_host_channel(&mut self, timeout: Duration) -> Result<NewHostChannel> {
        if self.shut_down {
            return Err(LinkError::HostStopped);
        }

        let peer_id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;

        let channel = Channel::listen(peer_id, self.events_tx.clone())?;
        let channel_info = ChannelToken::new(channel.id(), self.config.switches.clone()).encode();
        self.watchdog.add_process_host(peer_id, timeout)?;
        self.peers.insert(peer_id, HostPeer::new(peer_id, channel));

        info!("Created {} (connect timeout {:?})", peer_id, timeout);
        Ok(NewHostChannel {
            peer_id,
            channel_info,
        })
    }

    /// Handle the next channel or watchdog event. Returns false once the
    /// context has shut down.
    ///
    /// Cancel-safe: dropping the future before it completes loses no event.
    pub async fn process_next(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        tokio::select! {
            Some((peer_id, event)) = self.events_rx.recv() => {
                self.on_channel_event(peer_id, event);
            }
            Some(event) = self.watchdog_rx.recv() => {
                self.on_watchdog_event(event);
            }
            else => return false,
        }
        true
    }

    /// Run the control loop until `shutdown` completes, then shut down.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                running = self.process_next() => {
                    if !running {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    async fn serve(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::CreateHostChannel { timeout, reply }) => {
                        let _ = reply.send(self.create_host_channel(timeout));
                    }
                    Some(Command::Shutdown) | None => break,
                },
                running = self.process_next() => {
                    if !running {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    fn on_channel_event(&mut self, peer_id: PeerId, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { peer_pid } => {
                let Some(peer) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                peer.on_connected(peer_pid);
                let handle = Box::new(OsProcessHandle::open(peer_pid));
                match self.watchdog.mark_connected(peer_id, handle) {
                    Ok(true) => {}
                    Ok(false) => debug!("{} connected after its deadline", peer_id),
                    Err(e) => error!("Failed to mark {} connected: {}", peer_id, e),
                }
            }
            ChannelEvent::Message(message) => {
                // Taken out of the map so the context can serve the peer.
                let Some(mut peer) = self.peers.remove(&peer_id) else {
                    debug!("Dropping message for destroyed {}", peer_id);
                    return;
                };
                peer.on_message_received(message, self);
                self.peers.insert(peer_id, peer);
            }
            ChannelEvent::BadMessage { reason } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.on_bad_message(&reason);
                }
            }
            ChannelEvent::Error { reason } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.on_error(reason);
                }
                self.destroy_peer(peer_id);
            }
        }
    }

    fn on_watchdog_event(&mut self, event: WatchdogEvent) {
        match event {
            WatchdogEvent::ConnectTimeout(peer_id) => {
                warn!("{} timed out waiting for its client", peer_id);
                self.destroy_peer(peer_id);
            }
            WatchdogEvent::ProcessExited { peer, pid } => {
                info!("Client process {} of {} is gone", pid, peer);
                self.destroy_peer(peer);
            }
        }
    }

    /// Tear a peer down: release its routes, stop supervising it and close
    /// its channel. Returns false if the peer was already gone.
    pub fn destroy_peer(&mut self, peer_id: PeerId) -> bool {
        let Some(mut peer) = self.peers.remove(&peer_id) else {
            return false;
        };
        peer.teardown(&mut self.profiles);
        if let Err(e) = self.watchdog.forget(peer_id) {
            warn!("Failed to stop supervising {}: {}", peer_id, e);
        }
        info!("Destroyed {}", peer_id);
        true
    }

    /// Stop the watchdog, tear down every peer, then destroy every profile.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let stranded = self.watchdog.shutdown();
        if !stranded.is_empty() {
            debug!("{} peers were still supervised at shutdown", stranded.len());
        }

        let mut peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        peer_ids.sort();
        for peer_id in peer_ids {
            self.destroy_peer(peer_id);
        }
        self.profiles.destroy_all();
        info!("Host control plane stopped");
    }
}

impl HostServices for HostContext {
    fn profiles(&mut self) -> &mut ProfileManager {
        &mut self.profiles
    }

    fn create_host_channel(&mut self, timeout: Duration) -> Result<String> {
        HostContext::create_host_channel(self, timeout).map(|created| created.channel_info)
    }

    fn clear_web_cache(&mut self) {
        self.web_cache_clears += 1;
        match self.web_cache_handler.as_mut() {
            Some(handler) => handler(),
            None => debug!("No web cache handler installed"),
        }
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Command {
    CreateHostChannel {
        timeout: Duration,
        reply: oneshot::Sender<Result<NewHostChannel>>,
    },
    Shutdown,
}

/// Handle to a host control loop running on its own thread.
pub struct HostHandle {
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HostHandle {
    pub const THREAD_NAME: &'static str = "hostlink_control";

    /// Start the control thread. Returns once the context is up.
    pub fn spawn(config: HostConfig) -> Result<Self> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let mut host = match HostContext::new(config) {
                        Ok(host) => host,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    host.serve(commands_rx).await;
                });
            })
            .map_err(|e| LinkError::io_with_context(e, "Failed to spawn host control thread"))?;

        ready_rx.recv().map_err(|_| LinkError::HostStopped)??;
        Ok(Self {
            commands,
            thread: Some(thread),
        })
    }

    /// Create a host channel on the control thread.
    pub async fn create_host_channel(&self, timeout: Duration) -> Result<NewHostChannel> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::CreateHostChannel { timeout, reply })
            .map_err(|_| LinkError::HostStopped)?;
        reply_rx.await.map_err(|_| LinkError::HostStopped)?
    }

    /// Blocking variant of `create_host_channel` for threads outside any
    /// runtime.
    pub fn blocking_create_host_channel(&self, timeout: Duration) -> Result<NewHostChannel> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::CreateHostChannel { timeout, reply })
            .map_err(|_| LinkError::HostStopped)?;
        reply_rx.blocking_recv().map_err(|_| LinkError::HostStopped)?
    }

    /// Stop the control loop and wait for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            warn!("Host control thread panicked");
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::TrackedState;

    #[tokio::test]
    async fn test_create_host_channel_is_supervised() {
        let mut host = HostContext::new(HostConfig::default().with_switch("lang", "en")).unwrap();
        let created = host.create_host_channel(Duration::from_secs(30)).unwrap();

        let token = ChannelToken::decode(&created.channel_info).unwrap();
        assert_eq!(token.switch("lang"), Some("en"));
        assert_eq!(
            token.channel_id,
            host.peer(created.peer_id).unwrap().channel_id()
        );
        assert_eq!(
            host.watchdog().state_of(created.peer_id).unwrap(),
            Some(TrackedState::Unconnected)
        );
    }

    #[tokio::test]
    async fn test_unconnected_peer_is_destroyed_on_timeout() {
        let mut host = HostContext::new(HostConfig::default()).unwrap();
        let created = host.create_host_channel(Duration::from_millis(50)).unwrap();

        let processed = tokio::time::timeout(Duration::from_secs(5), host.process_next())
            .await
            .unwrap();
        assert!(processed);
        assert!(host.peer(created.peer_id).is_none());
        assert_eq!(host.watchdog().state_of(created.peer_id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_final() {
        let mut host = HostContext::new(HostConfig::default()).unwrap();
        host.create_host_channel(Duration::from_secs(30)).unwrap();

        host.shutdown();
        assert_eq!(host.peer_count(), 0);
        assert!(!host.process_next().await);
        assert!(matches!(
            host.create_host_channel(Duration::from_secs(1)),
            Err(LinkError::HostStopped)
        ));
    }

    #[test]
    fn test_dedicated_thread_handle() {
        let handle = HostHandle::spawn(HostConfig::default()).unwrap();
        let created = handle
            .blocking_create_host_channel(Duration::from_secs(30))
            .unwrap();
        assert!(ChannelToken::decode(&created.channel_info).is_ok());

        handle.shutdown();
    }
}
