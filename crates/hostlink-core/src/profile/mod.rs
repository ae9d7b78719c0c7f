//! Shared profiles and the objects that reference them across the channel.
//!
//! - `manager` - the host-side owner of every profile
//! - `host` - the routed host proxy for one client reference
//! - `proxy` - the client-side handle that drives a host proxy
//! - `config` - value types carried by configuration messages

pub mod config;
pub mod host;
pub mod manager;
pub mod proxy;

pub use config::{ProxyConfig, ProxyServer, ProxyType, SpellCheckConfig};
pub use host::ProfileHost;
pub use manager::{Profile, ProfileFlags, ProfileId, ProfileManager, ProxySetting};
pub use proxy::ProfileProxy;
