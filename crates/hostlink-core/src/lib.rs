//! Hostlink Core - control plane for an embedded multi-process browser engine.
//!
//! A host application process supervises client processes that run rendering
//! engines. This crate keeps the two sides consistent: it names channels and
//! hands them to spawned clients, multiplexes many logical objects over each
//! channel, supervises client processes, and owns the profiles those objects
//! share.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostlink_core::{HostConfig, HostContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> hostlink_core::Result<()> {
//!     let mut host = HostContext::new(HostConfig::default())?;
//!
//!     // Pass `channel_info` to the client process on its command line.
//!     let created = host.create_host_channel(Duration::from_secs(30))?;
//!     println!("client token: {}", created.channel_info);
//!
//!     host.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await;
//!     Ok(())
//! }
//! ```

pub mod channel_info;
pub mod config;
pub mod error;
pub mod host;
pub mod ipc;
pub mod platform;
pub mod profile;
pub mod routing;
pub mod watchdog;

// Re-export commonly used types
pub use channel_info::{ChannelToken, DecodeError};
pub use config::{ControlLoop, HostConfig, ThreadMode, BINARY_VERSION};
pub use error::{LinkError, Result};
pub use host::{HostContext, HostHandle, NewHostChannel, WebCacheHandler};
pub use ipc::{ClientPeer, Dispatch, HostPeer, Listener, Message, PeerId, ProtocolError};
pub use profile::{
    Profile, ProfileFlags, ProfileId, ProfileManager, ProfileProxy, ProxyConfig, ProxySetting,
    ProxyType, SpellCheckConfig,
};
pub use routing::{RoutingId, RoutingTable};
pub use watchdog::{ProcessWatchdog, TrackedState, WatchdogEvent};
