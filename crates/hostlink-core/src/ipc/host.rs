//! Host-side peer.
//!
//! One `HostPeer` exists per client channel. It owns the channel and the
//! routing table of every `ProfileHost` created for that client, handles
//! control messages itself and forwards routed messages to the table.

use super::messages::{ControlHostMsg, ControlMsg, CreateNewHostChannelReply, ProfileControlMsg};
use super::peer::{deliver, reply_for, Dispatch, Listener};
use super::protocol::{Message, ProtocolError};
use super::transport::Channel;
use super::PeerId;
use crate::profile::{ProfileHost, ProfileManager};
use crate::routing::{RoutingId, RoutingIdAllocator, RoutingTable};
use crate::Result;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type HostRoutes = RoutingTable<Box<dyn Listener<Context = ProfileManager>>>;

/// What a host peer needs from its surroundings while handling messages.
pub trait HostServices {
    fn profiles(&mut self) -> &mut ProfileManager;

    /// Create a new unconnected host channel and return its encoded token.
    fn create_host_channel(&mut self, timeout: Duration) -> Result<String>;

    /// Drop the web cache of every renderer this host serves.
    fn clear_web_cache(&mut self);
}

/// Host end of one client channel.
pub struct HostPeer {
    id: PeerId,
    channel: Channel,
    routes: HostRoutes,
    routing_ids: RoutingIdAllocator,
    peer_pid: Option<u32>,
    bad_messages: u64,
}

impl HostPeer {
    pub fn new(id: PeerId, channel: Channel) -> Self {
        Self {
            id,
            channel,
            routes: RoutingTable::new(),
            routing_ids: RoutingIdAllocator::host(),
            peer_pid: None,
            bad_messages: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    pub fn send(&self, message: Message) -> bool {
        self.channel.send(message)
    }

    /// Hand the client the name of the channel its in-process renderer
    /// should use.
    pub fn set_channel_name(&self, channel_name: &str) -> bool {
        let message = ControlMsg::SetChannelName {
            channel_name: channel_name.to_string(),
        }
        .into_message();
        match message {
            Ok(message) => self.channel.send(message),
            Err(e) => {
                error!("Failed to encode channel name for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Next id of the host-allocated block. Never reused.
    pub fn get_unique_routing_id(&mut self) -> Result<RoutingId> {
        self.routing_ids.allocate()
    }

    /// Process id of the connected client, once the handshake completed.
    pub fn process_id(&self) -> Option<u32> {
        self.peer_pid
    }

    /// Number of protocol violations seen on this channel.
    pub fn bad_message_count(&self) -> u64 {
        self.bad_messages
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Whether a listener is registered at `id`.
    pub fn has_route(&self, id: RoutingId) -> bool {
        self.routes.contains(id)
    }

    /// Register a host-side listener.
    pub fn add_route(
        &mut self,
        id: RoutingId,
        listener: Box<dyn Listener<Context = ProfileManager>>,
    ) -> Result<()> {
        self.routes.add(id, listener)
    }

    /// Unregister `id`, letting the listener release what it holds.
    pub fn remove_route(&mut self, id: RoutingId, profiles: &mut ProfileManager) -> bool {
        match self.routes.remove(id) {
            Some(mut listener) => {
                listener.on_route_removed(profiles);
                true
            }
            None => false,
        }
    }

    pub fn on_connected(&mut self, peer_pid: u32) {
        info!("{} connected to process {}", self.id, peer_pid);
        self.peer_pid = Some(peer_pid);
    }

    /// The channel failed. The owner tears the peer down afterwards.
    pub fn on_error(&mut self, reason: i32) {
        error!(
            "{} channel {} failed with reason {}",
            self.id,
            self.channel.id(),
            reason
        );
    }

    /// A frame on the channel could not be decoded.
    pub fn on_bad_message(&mut self, reason: &str) {
        self.bad_messages += 1;
        error!("Bad message from {}: {}", self.id, reason);
    }

    pub fn on_message_received(&mut self, message: Message, services: &mut dyn HostServices) {
        let outcome = if message.is_control() {
            self.on_control_message(&message, services)
        } else {
            deliver(
                self.routes.lookup_mut(message.routing_id),
                &message,
                services.profiles(),
            )
        };

        if let Err(err) = &outcome {
            self.on_bad_message(&err.to_string());
        }
        if let Some(reply) = reply_for(&message, &outcome) {
            self.channel.send(reply);
        }
    }

    fn on_control_message(
        &mut self,
        message: &Message,
        services: &mut dyn HostServices,
    ) -> std::result::Result<Dispatch, ProtocolError> {
        if let Some(control) = ControlHostMsg::from_message(message)? {
            return Ok(self.on_control_host_message(control, services));
        }
        if let Some(control) = ProfileControlMsg::from_message(message)? {
            return self.on_profile_control_message(message, control, services.profiles());
        }
        Err(ProtocolError::UnknownType {
            type_id: message.type_id,
        })
    }

    fn on_control_host_message(
        &mut self,
        control: ControlHostMsg,
        services: &mut dyn HostServices,
    ) -> Dispatch {
        match control {
            ControlHostMsg::Sync { is_final_sync } => {
                debug!("{} sync (final: {})", self.id, is_final_sync);
                Dispatch::Handled
            }
            ControlHostMsg::CreateNewHostChannel { timeout_ms } => {
                let timeout = Duration::from_millis(u64::from(timeout_ms));
                match services.create_host_channel(timeout) {
                    Ok(channel_info) => {
                        match serde_json::to_value(CreateNewHostChannelReply { channel_info }) {
                            Ok(reply) => Dispatch::Reply(reply),
                            Err(e) => {
                                error!("Failed to encode new channel reply: {}", e);
                                Dispatch::Unhandled
                            }
                        }
                    }
                    Err(e) => {
                        error!("{} could not create a host channel: {}", self.id, e);
                        Dispatch::Unhandled
                    }
                }
            }
            ControlHostMsg::ClearWebCache => {
                debug!("{} requested a web cache clear", self.id);
                services.clear_web_cache();
                Dispatch::Handled
            }
        }
    }

    fn on_profile_control_message(
        &mut self,
        message: &Message,
        control: ProfileControlMsg,
        profiles: &mut ProfileManager,
    ) -> std::result::Result<Dispatch, ProtocolError> {
        match control {
            ProfileControlMsg::New(params) => {
                let routing_id = params.routing_id;
                if !routing_id.is_client_allocated() {
                    return Err(ProtocolError::Malformed {
                        type_id: message.type_id,
                        reason: format!("routing_id({}) is not a client id", routing_id),
                    });
                }
                if self.routes.contains(routing_id) {
                    return Err(ProtocolError::Malformed {
                        type_id: message.type_id,
                        reason: format!("routing_id({}) is already in use", routing_id),
                    });
                }

                let host = match ProfileHost::new(&params, profiles) {
                    Ok(host) => host,
                    Err(e) => {
                        error!("{} could not create profile: {}", self.id, e);
                        return Ok(Dispatch::Unhandled);
                    }
                };
                if let Err(e) = self.routes.add(routing_id, Box::new(host)) {
                    // Checked above; only reachable if the table rejects the id.
                    error!("{}: {}", self.id, e);
                    return Ok(Dispatch::Unhandled);
                }
                Ok(Dispatch::Handled)
            }
            ProfileControlMsg::Destroy { routing_id } => {
                if !self.remove_route(routing_id, profiles) {
                    warn!("{} destroy for unknown routing_id({})", self.id, routing_id);
                }
                Ok(Dispatch::Handled)
            }
        }
    }

    /// Remove every route. Called when the channel goes away.
    pub fn teardown(&mut self, profiles: &mut ProfileManager) {
        let routes = self.routes.drain();
        if !routes.is_empty() {
            debug!("{} releasing {} routes", self.id, routes.len());
        }
        for (_, mut listener) in routes {
            listener.on_route_removed(profiles);
        }
    }
}

impl std::fmt::Debug for HostPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPeer")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("peer_pid", &self.peer_pid)
            .field("routes", &self.routes.len())
            .finish()
    }
}
