//! Host-side proxy for one client reference to a profile.

use super::manager::{ProfileFlags, ProfileId, ProfileManager};
use crate::ipc::messages::{NewProfileParams, ProfileHostMsg};
use crate::ipc::peer::{Dispatch, Listener};
use crate::ipc::protocol::{Message, ProtocolError};
use crate::routing::RoutingId;
use crate::Result;
use tracing::{debug, warn};

/// Routed listener standing in for a client-side `ProfileProxy`.
///
/// Holds one reference on its profile from creation until its route is
/// removed.
#[derive(Debug)]
pub struct ProfileHost {
    routing_id: RoutingId,
    profile: ProfileId,
}

impl ProfileHost {
    /// Obtain the profile named by `params` and wrap the reference.
    pub fn new(params: &NewProfileParams, profiles: &mut ProfileManager) -> Result<Self> {
        let flags = ProfileFlags {
            disk_cache_enabled: params.disk_cache_enabled,
            cookie_persistence_enabled: params.cookie_persistence_enabled,
        };
        let profile = profiles.obtain(&params.data_dir, flags)?;
        debug!(
            "ProfileHost routing_id({}) references {}",
            params.routing_id, profile
        );
        Ok(Self {
            routing_id: params.routing_id,
            profile,
        })
    }

    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile
    }
}

impl Listener for ProfileHost {
    type Context = ProfileManager;

    fn on_message_received(
        &mut self,
        message: &Message,
        profiles: &mut ProfileManager,
    ) -> std::result::Result<Dispatch, ProtocolError> {
        let Some(update) = ProfileHostMsg::from_message(message)? else {
            return Err(ProtocolError::UnknownType {
                type_id: message.type_id,
            });
        };
        let Some(profile) = profiles.get_mut(self.profile) else {
            warn!(
                "routing_id({}) refers to destroyed {}",
                self.routing_id, self.profile
            );
            return Ok(Dispatch::Unhandled);
        };

        match update {
            ProfileHostMsg::SetProxyConfig(config) => profile.set_proxy_config(config),
            ProfileHostMsg::UseSystemProxyConfig => profile.use_system_proxy_config(),
            ProfileHostMsg::SetSpellCheckConfig(config) => profile.set_spellcheck_config(config),
            ProfileHostMsg::AddCustomWords(words) => profile.add_custom_words(words),
            ProfileHostMsg::RemoveCustomWords(words) => profile.remove_custom_words(&words),
            ProfileHostMsg::AddAutocorrectWords {
                bad_words,
                good_words,
            } => profile.add_autocorrect_words(bad_words.into_iter().zip(good_words)),
            ProfileHostMsg::RemoveAutocorrectWords(bad_words) => {
                profile.remove_autocorrect_words(&bad_words)
            }
        }
        Ok(Dispatch::Handled)
    }

    fn on_route_removed(&mut self, profiles: &mut ProfileManager) {
        match profiles.release(self.profile) {
            Ok(()) => debug!("ProfileHost routing_id({}) released", self.routing_id),
            // The profile was destroyed first; nothing left to release.
            Err(e) => debug!("ProfileHost routing_id({}): {}", self.routing_id, e),
        }
    }
}
