//! Client-side peer.
//!
//! A client process holds exactly one `ClientPeer`, built from the channel
//! token on its command line. Sending is the only way to reach the host; the
//! peer's own routing table only receives host-to-client traffic.
//!
//! # Thread Safety
//!
//! The peer lives on the client's control task. Other tasks write to the
//! channel through cloned `ChannelSender`s.

use super::messages::{ControlHostMsg, ControlMsg, CreateNewHostChannelReply};
use super::peer::{deliver, reply_for, Dispatch, Listener};
use super::protocol::{Message, ProtocolError};
use super::transport::{Channel, ChannelEvent, ChannelSender};
use super::PeerId;
use crate::channel_info::{is_compatible_channel_name, ChannelToken};
use crate::routing::{RoutingId, RoutingIdAllocator, RoutingTable};
use crate::{LinkError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Called with the channel error reason code when the channel fails.
pub type ErrorHandler = Box<dyn FnMut(i32) + Send>;

type ClientRoutes = RoutingTable<Box<dyn Listener<Context = ChannelSender>>>;

const CLIENT_PEER: PeerId = PeerId(0);

/// Client end of a channel.
pub struct ClientPeer {
    channel: Channel,
    events: mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
    routes: ClientRoutes,
    routing_ids: RoutingIdAllocator,
    token: ChannelToken,
    host_pid: Option<u32>,
    renderer_channel_name: Option<String>,
    error_handler: Option<ErrorHandler>,
    bad_messages: u64,
    failed: bool,
}

impl ClientPeer {
    /// Decode a command-line channel token and connect to its channel.
    pub async fn connect(token: &str) -> Result<Self> {
        Self::connect_token(ChannelToken::decode(token)?).await
    }

    pub async fn connect_token(token: ChannelToken) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = Channel::connect(&token.channel_id, CLIENT_PEER, events_tx).await?;
        info!("Client connected to channel {}", token.channel_id);

        Ok(Self {
            channel,
            events,
            routes: RoutingTable::new(),
            routing_ids: RoutingIdAllocator::client(),
            token,
            host_pid: None,
            renderer_channel_name: None,
            error_handler: None,
            bad_messages: 0,
            failed: false,
        })
    }

    /// A peer over a channel with no connection behind it. Events are fed
    /// through the returned sender; outbound traffic lands in the receiver.
    #[cfg(test)]
    fn detached(
        token: ChannelToken,
    ) -> (
        Self,
        mpsc::UnboundedSender<(PeerId, ChannelEvent)>,
        mpsc::UnboundedReceiver<super::transport::Outbound>,
    ) {
        let (channel, outbound) = Channel::detached(&token.channel_id);
        let (events_tx, events) = mpsc::unbounded_channel();
        let peer = Self {
            channel,
            events,
            routes: RoutingTable::new(),
            routing_ids: RoutingIdAllocator::client(),
            token,
            host_pid: None,
            renderer_channel_name: None,
            error_handler: None,
            bad_messages: 0,
            failed: false,
        };
        (peer, events_tx, outbound)
    }

    /// The token this peer was started with.
    pub fn token(&self) -> &ChannelToken {
        &self.token
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    pub fn send(&self, message: Message) -> bool {
        self.channel.send(message)
    }

    pub fn sender(&self) -> ChannelSender {
        self.channel.sender()
    }

    /// Allocate a routing id from the client block.
    pub fn next_routing_id(&mut self) -> Result<RoutingId> {
        self.routing_ids.allocate()
    }

    /// Register a listener for host-to-client messages at `id`.
    pub fn add_route(
        &mut self,
        id: RoutingId,
        listener: Box<dyn Listener<Context = ChannelSender>>,
    ) -> Result<()> {
        self.routes.add(id, listener)
    }

    /// Unregister `id`. Unknown ids are a no-op.
    pub fn remove_route(&mut self, id: RoutingId) {
        if let Some(mut listener) = self.routes.remove(id) {
            let mut sender = self.channel.sender();
            listener.on_route_removed(&mut sender);
        }
    }

    /// Install the callback run when the channel fails. A client with a
    /// broken channel cannot receive further instructions, so the handler
    /// typically terminates the process.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    pub fn host_process_id(&self) -> Option<u32> {
        self.host_pid
    }

    /// Number of protocol violations seen from the host.
    pub fn bad_message_count(&self) -> u64 {
        self.bad_messages
    }

    pub fn is_connected(&self) -> bool {
        self.host_pid.is_some() && !self.failed
    }

    /// Channel name handed over by `ControlMsg::SetChannelName`.
    pub fn renderer_channel_name(&self) -> Option<&str> {
        self.renderer_channel_name.as_deref()
    }

    /// Process one channel event. Returns false once the channel has failed.
    pub async fn next_event(&mut self) -> bool {
        if self.failed {
            return false;
        }
        match self.events.recv().await {
            Some((_, event)) => self.on_event(event),
            None => self.on_error(super::transport::error_reason::PEER_CLOSED),
        }
        !self.failed
    }

    /// Process events until the channel fails.
    pub async fn run(&mut self) {
        while self.next_event().await {}
    }

    /// Process events until the handshake completes; returns the host's pid.
    pub async fn wait_connected(&mut self) -> Result<u32> {
        loop {
            if let Some(pid) = self.host_pid {
                return Ok(pid);
            }
            if !self.next_event().await {
                return Err(LinkError::ChannelClosed);
            }
        }
    }

    /// Wait until the host has processed every message sent before this one.
    ///
    /// The returned future does not borrow the peer, so it can be spawned
    /// while the peer keeps processing events.
    pub fn sync(&self, is_final_sync: bool) -> impl Future<Output = Result<()>> + Send + 'static {
        let sender = self.channel.sender();
        async move {
            let message = ControlHostMsg::Sync { is_final_sync }.into_message()?;
            sender.send_sync(message).await?;
            Ok(())
        }
    }

    /// Ask the host for a new channel another process can join.
    pub fn create_host_channel(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<ChannelToken>> + Send + 'static {
        let sender = self.channel.sender();
        async move {
            let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            let message = ControlHostMsg::CreateNewHostChannel { timeout_ms }.into_message()?;
            let reply = sender.send_sync(message).await?;
            let reply: CreateNewHostChannelReply = reply.payload_as()?;
            Ok(ChannelToken::decode(&reply.channel_info)?)
        }
    }

    /// Ask the host to clear the web cache of its renderers.
    pub fn clear_web_cache(&self) -> Result<()> {
        let message = ControlHostMsg::ClearWebCache.into_message()?;
        if self.channel.send(message) {
            Ok(())
        } else {
            Err(LinkError::ChannelClosed)
        }
    }

    fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { peer_pid } => self.on_connected(peer_pid),
            ChannelEvent::Message(message) => self.on_message_received(message),
            ChannelEvent::BadMessage { reason } => {
                self.bad_messages += 1;
                error!("Bad message from host: {}", reason);
            }
            ChannelEvent::Error { reason } => self.on_error(reason),
        }
    }

    fn on_connected(&mut self, peer_pid: u32) {
        info!("Client channel {} connected to host process {}", self.channel.id(), peer_pid);
        self.host_pid = Some(peer_pid);
    }

    fn on_error(&mut self, reason: i32) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!("Client channel {} failed with reason {}", self.channel.id(), reason);
        if let Some(handler) = self.error_handler.as_mut() {
            handler(reason);
        }
    }

    fn on_message_received(&mut self, message: Message) {
        let outcome = if message.is_control() {
            self.on_control_message(&message)
        } else {
            let mut sender = self.channel.sender();
            deliver(self.routes.lookup_mut(message.routing_id), &message, &mut sender)
        };

        if let Err(err) = &outcome {
            self.bad_messages += 1;
            error!("Bad message from host: {}", err);
        }
        if let Some(reply) = reply_for(&message, &outcome) {
            self.channel.send(reply);
        }
    }

    fn on_control_message(&mut self, message: &Message) -> std::result::Result<Dispatch, ProtocolError> {
        let Some(control) = ControlMsg::from_message(message)? else {
            return Err(ProtocolError::UnknownType {
                type_id: message.type_id,
            });
        };
        match control {
            ControlMsg::SetChannelName { channel_name } => {
                if !is_compatible_channel_name(&channel_name) {
                    return Err(ProtocolError::Malformed {
                        type_id: message.type_id,
                        reason: format!("incompatible channel name {:?}", channel_name),
                    });
                }
                debug!("Renderer channel name set to {}", channel_name);
                self.renderer_channel_name = Some(channel_name);
                Ok(Dispatch::Handled)
            }
        }
    }
}

impl std::fmt::Debug for ClientPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPeer")
            .field("channel", &self.channel)
            .field("host_pid", &self.host_pid)
            .field("routes", &self.routes.len())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BINARY_VERSION;
    use crate::ipc::transport::{error_reason, Outbound};
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Arc;

    type Events = mpsc::UnboundedSender<(PeerId, ChannelEvent)>;

    fn token() -> ChannelToken {
        ChannelToken::new(
            format!("{}.test.1", BINARY_VERSION),
            vec![("lang".to_string(), "en".to_string())],
        )
    }

    fn setup() -> (ClientPeer, Events, mpsc::UnboundedReceiver<Outbound>) {
        ClientPeer::detached(token())
    }

    fn push(events: &Events, event: ChannelEvent) {
        events.send((CLIENT_PEER, event)).unwrap();
    }

    fn sent(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Outbound::Send(message)) = outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    struct Counter {
        seen: Arc<AtomicUsize>,
    }

    impl Listener for Counter {
        type Context = ChannelSender;

        fn on_message_received(
            &mut self,
            _message: &Message,
            _sender: &mut ChannelSender,
        ) -> std::result::Result<Dispatch, ProtocolError> {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Dispatch::Reply(serde_json::json!(seen)))
        }
    }

    #[tokio::test]
    async fn test_wait_connected_records_host_pid() {
        let (mut client, events, _outbound) = setup();
        assert!(!client.is_connected());

        push(&events, ChannelEvent::Connected { peer_pid: 4321 });
        assert_eq!(client.wait_connected().await.unwrap(), 4321);
        assert_eq!(client.host_process_id(), Some(4321));
        assert!(client.is_connected());
        assert_eq!(client.token().switch("lang"), Some("en"));
    }

    #[tokio::test]
    async fn test_set_channel_name_is_stored() {
        let (mut client, events, mut outbound) = setup();
        let name = format!("{}.renderer.2", BINARY_VERSION);

        let message = ControlMsg::SetChannelName {
            channel_name: name.clone(),
        }
        .into_message()
        .unwrap();
        push(&events, ChannelEvent::Message(message));

        assert!(client.next_event().await);
        assert_eq!(client.renderer_channel_name(), Some(name.as_str()));
        assert_eq!(client.bad_message_count(), 0);
        assert!(sent(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_channel_name_is_bad_message() {
        let (mut client, events, mut outbound) = setup();

        let mut message = ControlMsg::SetChannelName {
            channel_name: "0.0.0-stale.renderer.2".to_string(),
        }
        .into_message()
        .unwrap()
        .into_sync();
        message.request_id = Some(3);
        push(&events, ChannelEvent::Message(message));

        assert!(client.next_event().await);
        assert_eq!(client.renderer_channel_name(), None);
        assert_eq!(client.bad_message_count(), 1);

        let replies = sent(&mut outbound);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].reply_error);
        assert_eq!(replies[0].request_id, Some(3));
    }

    #[tokio::test]
    async fn test_unknown_control_type_is_bad_message() {
        let (mut client, events, mut outbound) = setup();

        push(&events, ChannelEvent::Message(Message::control(0x0001_7777)));
        push(
            &events,
            ChannelEvent::BadMessage {
                reason: "not json".to_string(),
            },
        );

        assert!(client.next_event().await);
        assert!(client.next_event().await);
        assert_eq!(client.bad_message_count(), 2);
        // Protocol violations keep the channel alive.
        assert!(!client.failed);
        assert!(sent(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn test_sync_to_missing_route_gets_one_error_reply() {
        let (mut client, events, mut outbound) = setup();

        let mut request = Message::new(RoutingId(5), 42).into_sync();
        request.request_id = Some(8);
        push(&events, ChannelEvent::Message(request));

        assert!(client.next_event().await);
        let replies = sent(&mut outbound);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].reply_error);
        assert_eq!(replies[0].request_id, Some(8));
        assert_eq!(client.bad_message_count(), 0);
    }

    #[tokio::test]
    async fn test_routed_message_reaches_listener() {
        let (mut client, events, mut outbound) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let id = RoutingId(3);
        client
            .add_route(
                id,
                Box::new(Counter {
                    seen: Arc::clone(&seen),
                }),
            )
            .unwrap();

        push(&events, ChannelEvent::Message(Message::new(id, 42)));
        let mut request = Message::new(id, 42).into_sync();
        request.request_id = Some(1);
        push(&events, ChannelEvent::Message(request));
        assert!(client.next_event().await);
        assert!(client.next_event().await);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let replies = sent(&mut outbound);
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].reply_error);
        assert_eq!(replies[0].payload, serde_json::json!(2));

        client.remove_route(id);
        client.remove_route(id);
        push(&events, ChannelEvent::Message(Message::new(id, 42)));
        assert!(client.next_event().await);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_error_runs_handler_once() {
        let (mut client, events, _outbound) = setup();
        let calls = Arc::new(AtomicI32::new(0));
        let reason = Arc::new(AtomicI32::new(0));
        let (seen_calls, seen_reason) = (Arc::clone(&calls), Arc::clone(&reason));
        client.set_error_handler(Box::new(move |code| {
            seen_calls.fetch_add(1, Ordering::SeqCst);
            seen_reason.store(code, Ordering::SeqCst);
        }));

        push(
            &events,
            ChannelEvent::Error {
                reason: error_reason::READ_FAILED,
            },
        );
        push(
            &events,
            ChannelEvent::Error {
                reason: error_reason::WRITE_FAILED,
            },
        );

        assert!(!client.next_event().await);
        assert!(!client.next_event().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reason.load(Ordering::SeqCst), error_reason::READ_FAILED);
    }

    #[tokio::test]
    async fn test_closed_event_stream_is_peer_closed() {
        let (mut client, events, _outbound) = setup();
        let reason = Arc::new(AtomicI32::new(0));
        let seen = Arc::clone(&reason);
        client.set_error_handler(Box::new(move |code| seen.store(code, Ordering::SeqCst)));

        drop(events);
        client.run().await;
        assert_eq!(reason.load(Ordering::SeqCst), error_reason::PEER_CLOSED);
        assert!(matches!(
            client.wait_connected().await,
            Err(LinkError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_sync_future_does_not_borrow_peer() {
        let (client, _events, mut outbound) = setup();

        // Spawning needs a Send + 'static future.
        let request = tokio::spawn(client.sync(true));
        drop(client);

        match outbound.recv().await {
            Some(Outbound::Request(message, reply)) => {
                assert!(message.sync);
                assert_eq!(
                    ControlHostMsg::from_message(&message).unwrap(),
                    Some(ControlHostMsg::Sync {
                        is_final_sync: true
                    })
                );
                reply
                    .send(Ok(message.reply_with(serde_json::Value::Null)))
                    .unwrap();
            }
            _ => panic!("expected a sync request"),
        }
        request.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_create_host_channel_decodes_reply() {
        let (client, _events, mut outbound) = setup();

        let request = tokio::spawn(client.create_host_channel(Duration::from_secs(5)));
        match outbound.recv().await {
            Some(Outbound::Request(message, reply)) => {
                assert_eq!(
                    ControlHostMsg::from_message(&message).unwrap(),
                    Some(ControlHostMsg::CreateNewHostChannel { timeout_ms: 5000 })
                );
                let payload = serde_json::to_value(CreateNewHostChannelReply {
                    channel_info: token().encode(),
                })
                .unwrap();
                reply.send(Ok(message.reply_with(payload))).unwrap();
            }
            _ => panic!("expected a sync request"),
        }
        assert_eq!(request.await.unwrap().unwrap(), token());
    }

    #[tokio::test]
    async fn test_clear_web_cache_is_not_sync() {
        let (client, _events, mut outbound) = setup();

        client.clear_web_cache().unwrap();
        let messages = sent(&mut outbound);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].sync);
        assert_eq!(messages[0].type_id, ControlHostMsg::CLEAR_WEB_CACHE);
    }
}
