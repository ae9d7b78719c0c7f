//! Client-side handle on a host profile.
//!
//! Client code never touches a profile directly; every operation here is a
//! routed message to the `ProfileHost` created for this proxy's routing id.

use super::config::{ProxyConfig, SpellCheckConfig};
use super::manager::ProfileFlags;
use crate::ipc::messages::{NewProfileParams, ProfileControlMsg, ProfileHostMsg};
use crate::ipc::{ChannelSender, ClientPeer};
use crate::routing::RoutingId;
use crate::{LinkError, Result};
use tracing::debug;

/// One client-side reference to a shared profile.
///
/// The reference is released on the host by `destroy`, or on drop.
#[derive(Debug)]
pub struct ProfileProxy {
    routing_id: RoutingId,
    sender: ChannelSender,
    destroyed: bool,
}

impl ProfileProxy {
    /// Ask the host for the profile at `data_dir` (empty for incognito).
    pub fn create(client: &mut ClientPeer, data_dir: &str, flags: ProfileFlags) -> Result<Self> {
        let routing_id = client.next_routing_id()?;
        let message = ProfileControlMsg::New(NewProfileParams {
            routing_id,
            data_dir: data_dir.to_string(),
            disk_cache_enabled: flags.disk_cache_enabled,
            cookie_persistence_enabled: flags.cookie_persistence_enabled,
        })
        .into_message()?;
        if !client.send(message) {
            return Err(LinkError::ChannelClosed);
        }
        debug!("Requested profile {:?} at routing_id({})", data_dir, routing_id);

        Ok(Self {
            routing_id,
            sender: client.sender(),
            destroyed: false,
        })
    }

    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    fn send(&self, update: ProfileHostMsg) -> Result<()> {
        let message = update.into_message(self.routing_id)?;
        if self.sender.send(message) {
            Ok(())
        } else {
            Err(LinkError::ChannelClosed)
        }
    }

    pub fn set_proxy_config(&self, config: ProxyConfig) -> Result<()> {
        self.send(ProfileHostMsg::SetProxyConfig(config))
    }

    pub fn use_system_proxy_config(&self) -> Result<()> {
        self.send(ProfileHostMsg::UseSystemProxyConfig)
    }

    pub fn set_spellcheck_config(&self, config: SpellCheckConfig) -> Result<()> {
        self.send(ProfileHostMsg::SetSpellCheckConfig(config))
    }

    pub fn add_custom_words(&self, words: Vec<String>) -> Result<()> {
        self.send(ProfileHostMsg::AddCustomWords(words))
    }

    pub fn remove_custom_words(&self, words: Vec<String>) -> Result<()> {
        self.send(ProfileHostMsg::RemoveCustomWords(words))
    }

    /// Add autocorrect replacements; `bad_words[i]` is replaced by
    /// `good_words[i]`.
    pub fn add_autocorrect_words(&self, bad_words: Vec<String>, good_words: Vec<String>) -> Result<()> {
        if bad_words.len() != good_words.len() {
            return Err(LinkError::Config {
                message: format!(
                    "{} bad words but {} good words",
                    bad_words.len(),
                    good_words.len()
                ),
            });
        }
        self.send(ProfileHostMsg::AddAutocorrectWords {
            bad_words,
            good_words,
        })
    }

    pub fn remove_autocorrect_words(&self, bad_words: Vec<String>) -> Result<()> {
        self.send(ProfileHostMsg::RemoveAutocorrectWords(bad_words))
    }

    /// Release this reference on the host.
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        let message = ProfileControlMsg::Destroy {
            routing_id: self.routing_id,
        }
        .into_message()?;
        if self.sender.send(message) {
            Ok(())
        } else {
            Err(LinkError::ChannelClosed)
        }
    }
}

impl Drop for ProfileProxy {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        // A failed channel already released everything on the host.
        if let Ok(message) = (ProfileControlMsg::Destroy {
            routing_id: self.routing_id,
        })
        .into_message()
        {
            let _ = self.sender.send(message);
        }
    }
}
