//! Centralized configuration for the hostlink control plane.
//!
//! Compile-time constants for channels and the process watchdog, plus the
//! runtime `HostConfig` resolved once at startup.

use std::time::Duration;

/// Version string of the running binary. Channel names are prefixed with it.
pub const BINARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Channel and wire-protocol configuration.
pub struct IpcConfig;

impl IpcConfig {
    /// Wire protocol version exchanged in the hello frame.
    pub const PROTOCOL_VERSION: u16 = 1;
    /// Maximum payload size of a single frame (16 MiB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    /// Address host channels listen on. The OS assigns the port.
    pub const LISTEN_ADDR: &'static str = "127.0.0.1:0";
    /// How long a client waits for the host's listening socket.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Separator between the version prefix and the rest of a channel name.
    pub const CHANNEL_NAME_SEPARATOR: char = '.';
}

/// Process watchdog configuration.
pub struct WatchdogConfig;

impl WatchdogConfig {
    /// Default time an unconnected host peer may wait for its client.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Interval at which connected process handles are checked.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const THREAD_NAME: &'static str = "hostlink_watchdog";
}

/// Threading arrangement of the supervising side.
///
/// `Original` runs the host control loop on a dedicated thread inside the
/// application process. `RendererMain` leaves the host in another process;
/// the application thread is a client and whoever hosts the loop drives it
/// on its own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadMode {
    #[default]
    Original,
    RendererMain,
}

/// Where the host control loop runs, resolved from a `ThreadMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLoop {
    /// Spawn a dedicated control thread and talk to it through a `HostHandle`.
    DedicatedThread,
    /// The caller's thread drives `HostContext::run` itself.
    CallerThread,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMode::Original => "original",
            ThreadMode::RendererMain => "renderer-main",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "original" => Some(ThreadMode::Original),
            "renderer-main" | "renderer_main" => Some(ThreadMode::RendererMain),
            _ => None,
        }
    }

    /// Resolve the placement of the host control loop.
    pub fn control_loop(&self) -> ControlLoop {
        match self {
            ThreadMode::Original => ControlLoop::DedicatedThread,
            ThreadMode::RendererMain => ControlLoop::CallerThread,
        }
    }
}

impl std::fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime configuration of a host process.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Threading arrangement.
    pub thread_mode: ThreadMode,
    /// Handshake timeout used when callers do not pass one.
    pub connect_timeout: Duration,
    /// Watchdog poll tick for connected processes.
    pub poll_interval: Duration,
    /// Switches handed to every spawned client inside its channel token.
    pub switches: Vec<(String, String)>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            thread_mode: ThreadMode::default(),
            connect_timeout: WatchdogConfig::DEFAULT_CONNECT_TIMEOUT,
            poll_interval: WatchdogConfig::POLL_INTERVAL,
            switches: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn with_thread_mode(mut self, mode: ThreadMode) -> Self {
        self.thread_mode = mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Add a switch inherited by spawned clients.
    pub fn with_switch(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.switches.push((key.into(), value.into()));
        self
    }
}
