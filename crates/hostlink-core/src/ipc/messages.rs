//! The fixed message set of the control plane.
//!
//! Control messages travel on `RoutingId::CONTROL` and are handled by the
//! peers themselves; profile configuration messages are routed to the
//! `ProfileHost` registered at the message's routing id.

use super::protocol::{block, message_type, Message, ProtocolError};
use crate::profile::{ProxyConfig, SpellCheckConfig};
use crate::routing::RoutingId;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Control messages sent by a client to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlHostMsg {
    /// Flush: the reply arrives after every earlier message was processed.
    Sync { is_final_sync: bool },
    /// Ask the host for a new channel another process can join.
    CreateNewHostChannel { timeout_ms: u32 },
    /// Drop the web cache of every renderer the host serves. Not synchronous.
    ClearWebCache,
}

/// Reply payload of `ControlHostMsg::CreateNewHostChannel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNewHostChannelReply {
    pub channel_info: String,
}

#[derive(Serialize, Deserialize)]
struct SyncPayload {
    is_final_sync: bool,
}

#[derive(Serialize, Deserialize)]
struct TimeoutPayload {
    timeout_ms: u32,
}

impl ControlHostMsg {
    pub const SYNC: u32 = message_type(block::CONTROL, 1);
    pub const CREATE_NEW_HOST_CHANNEL: u32 = message_type(block::CONTROL, 2);
    pub const CLEAR_WEB_CACHE: u32 = message_type(block::CONTROL, 3);

    /// Whether the sender waits for a reply.
    pub fn is_sync(&self) -> bool {
        !matches!(self, ControlHostMsg::ClearWebCache)
    }

    pub fn into_message(self) -> Result<Message> {
        let sync = self.is_sync();
        let message = match self {
            ControlHostMsg::Sync { is_final_sync } => {
                Message::control(Self::SYNC).with_payload(&SyncPayload { is_final_sync })?
            }
            ControlHostMsg::CreateNewHostChannel { timeout_ms } => {
                Message::control(Self::CREATE_NEW_HOST_CHANNEL)
                    .with_payload(&TimeoutPayload { timeout_ms })?
            }
            ControlHostMsg::ClearWebCache => Message::control(Self::CLEAR_WEB_CACHE),
        };
        Ok(if sync { message.into_sync() } else { message })
    }

    /// Decode a control message. `Ok(None)` if the type is not in this set.
    pub fn from_message(message: &Message) -> std::result::Result<Option<Self>, ProtocolError> {
        let decoded = match message.type_id {
            Self::SYNC => {
                let p: SyncPayload = message.payload_as()?;
                ControlHostMsg::Sync {
                    is_final_sync: p.is_final_sync,
                }
            }
            Self::CREATE_NEW_HOST_CHANNEL => {
                let p: TimeoutPayload = message.payload_as()?;
                ControlHostMsg::CreateNewHostChannel {
                    timeout_ms: p.timeout_ms,
                }
            }
            Self::CLEAR_WEB_CACHE => ControlHostMsg::ClearWebCache,
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

/// Control messages sent by a host to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Hand a newly spawned in-process worker its channel name.
    SetChannelName { channel_name: String },
}

#[derive(Serialize, Deserialize)]
struct ChannelNamePayload {
    channel_name: String,
}

impl ControlMsg {
    pub const SET_CHANNEL_NAME: u32 = message_type(block::CONTROL, 16);

    pub fn into_message(self) -> Result<Message> {
        match self {
            ControlMsg::SetChannelName { channel_name } => Message::control(Self::SET_CHANNEL_NAME)
                .with_payload(&ChannelNamePayload { channel_name }),
        }
    }

    pub fn from_message(message: &Message) -> std::result::Result<Option<Self>, ProtocolError> {
        match message.type_id {
            Self::SET_CHANNEL_NAME => {
                let p: ChannelNamePayload = message.payload_as()?;
                Ok(Some(ControlMsg::SetChannelName {
                    channel_name: p.channel_name,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Parameters of a new profile reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProfileParams {
    pub routing_id: RoutingId,
    /// Empty for an incognito profile.
    pub data_dir: String,
    pub disk_cache_enabled: bool,
    pub cookie_persistence_enabled: bool,
}

/// Profile lifecycle messages. These are control messages: the routing id
/// they talk about is in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileControlMsg {
    New(NewProfileParams),
    Destroy { routing_id: RoutingId },
}

#[derive(Serialize, Deserialize)]
struct DestroyPayload {
    routing_id: RoutingId,
}

impl ProfileControlMsg {
    pub const NEW: u32 = message_type(block::PROFILE, 1);
    pub const DESTROY: u32 = message_type(block::PROFILE, 2);

    pub fn into_message(self) -> Result<Message> {
        match self {
            ProfileControlMsg::New(params) => Message::control(Self::NEW).with_payload(&params),
            ProfileControlMsg::Destroy { routing_id } => {
                Message::control(Self::DESTROY).with_payload(&DestroyPayload { routing_id })
            }
        }
    }

    pub fn from_message(message: &Message) -> std::result::Result<Option<Self>, ProtocolError> {
        match message.type_id {
            Self::NEW => Ok(Some(ProfileControlMsg::New(message.payload_as()?))),
            Self::DESTROY => {
                let p: DestroyPayload = message.payload_as()?;
                Ok(Some(ProfileControlMsg::Destroy {
                    routing_id: p.routing_id,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Configuration updates routed to one profile reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileHostMsg {
    SetProxyConfig(ProxyConfig),
    UseSystemProxyConfig,
    SetSpellCheckConfig(SpellCheckConfig),
    AddCustomWords(Vec<String>),
    RemoveCustomWords(Vec<String>),
    AddAutocorrectWords {
        bad_words: Vec<String>,
        good_words: Vec<String>,
    },
    RemoveAutocorrectWords(Vec<String>),
}

#[derive(Serialize, Deserialize)]
struct WordsPayload {
    words: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct AutocorrectPayload {
    bad_words: Vec<String>,
    #[serde(default)]
    good_words: Vec<String>,
}

impl ProfileHostMsg {
    pub const SET_PROXY_CONFIG: u32 = message_type(block::PROFILE, 16);
    pub const USE_SYSTEM_PROXY_CONFIG: u32 = message_type(block::PROFILE, 17);
    pub const SET_SPELLCHECK_CONFIG: u32 = message_type(block::PROFILE, 18);
    pub const ADD_CUSTOM_WORDS: u32 = message_type(block::PROFILE, 19);
    pub const REMOVE_CUSTOM_WORDS: u32 = message_type(block::PROFILE, 20);
    pub const ADD_AUTOCORRECT_WORDS: u32 = message_type(block::PROFILE, 21);
    pub const REMOVE_AUTOCORRECT_WORDS: u32 = message_type(block::PROFILE, 22);

    pub fn type_id(&self) -> u32 {
        match self {
            ProfileHostMsg::SetProxyConfig(_) => Self::SET_PROXY_CONFIG,
            ProfileHostMsg::UseSystemProxyConfig => Self::USE_SYSTEM_PROXY_CONFIG,
            ProfileHostMsg::SetSpellCheckConfig(_) => Self::SET_SPELLCHECK_CONFIG,
            ProfileHostMsg::AddCustomWords(_) => Self::ADD_CUSTOM_WORDS,
            ProfileHostMsg::RemoveCustomWords(_) => Self::REMOVE_CUSTOM_WORDS,
            ProfileHostMsg::AddAutocorrectWords { .. } => Self::ADD_AUTOCORRECT_WORDS,
            ProfileHostMsg::RemoveAutocorrectWords(_) => Self::REMOVE_AUTOCORRECT_WORDS,
        }
    }

    pub fn into_message(self, routing_id: RoutingId) -> Result<Message> {
        let message = Message::new(routing_id, self.type_id());
        match self {
            ProfileHostMsg::SetProxyConfig(config) => message.with_payload(&config),
            ProfileHostMsg::UseSystemProxyConfig => Ok(message),
            ProfileHostMsg::SetSpellCheckConfig(config) => message.with_payload(&config),
            ProfileHostMsg::AddCustomWords(words) | ProfileHostMsg::RemoveCustomWords(words) => {
                message.with_payload(&WordsPayload { words })
            }
            ProfileHostMsg::AddAutocorrectWords {
                bad_words,
                good_words,
            } => message.with_payload(&AutocorrectPayload {
                bad_words,
                good_words,
            }),
            ProfileHostMsg::RemoveAutocorrectWords(bad_words) => {
                message.with_payload(&AutocorrectPayload {
                    bad_words,
                    good_words: Vec::new(),
                })
            }
        }
    }

    pub fn from_message(message: &Message) -> std::result::Result<Option<Self>, ProtocolError> {
        let decoded = match message.type_id {
            Self::SET_PROXY_CONFIG => ProfileHostMsg::SetProxyConfig(message.payload_as()?),
            Self::USE_SYSTEM_PROXY_CONFIG => ProfileHostMsg::UseSystemProxyConfig,
            Self::SET_SPELLCHECK_CONFIG => {
                ProfileHostMsg::SetSpellCheckConfig(message.payload_as()?)
            }
            Self::ADD_CUSTOM_WORDS => {
                let p: WordsPayload = message.payload_as()?;
                ProfileHostMsg::AddCustomWords(p.words)
            }
            Self::REMOVE_CUSTOM_WORDS => {
                let p: WordsPayload = message.payload_as()?;
                ProfileHostMsg::RemoveCustomWords(p.words)
            }
            Self::ADD_AUTOCORRECT_WORDS => {
                let p: AutocorrectPayload = message.payload_as()?;
                if p.bad_words.len() != p.good_words.len() {
                    return Err(ProtocolError::Malformed {
                        type_id: message.type_id,
                        reason: format!(
                            "{} bad words but {} good words",
                            p.bad_words.len(),
                            p.good_words.len()
                        ),
                    });
                }
                ProfileHostMsg::AddAutocorrectWords {
                    bad_words: p.bad_words,
                    good_words: p.good_words,
                }
            }
            Self::REMOVE_AUTOCORRECT_WORDS => {
                let p: AutocorrectPayload = message.payload_as()?;
                ProfileHostMsg::RemoveAutocorrectWords(p.bad_words)
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}
