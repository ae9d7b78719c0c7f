//! Loopback TCP channels.
//!
//! A host channel listens on `127.0.0.1` with an OS-assigned port and accepts
//! exactly one connection. Its id is `<version>.<uuid>.<port>`, so a client
//! holding the id can both check compatibility and find the port.
//!
//! Each connected channel runs two tasks:
//!
//! - a reader task that pumps frames off the socket (`read_frame` is not
//!   cancel-safe, so it never sits inside a `select!`);
//! - a router task that owns the write half, matches replies to pending sync
//!   requests and forwards everything else to the owning peer's event sink.
//!
//! Replies are matched here rather than on the peer's control thread, so a
//! peer awaiting a sync reply never blocks its own inbound processing.

use super::protocol::{read_frame, write_message, Hello, Message, ProtocolError, HELLO_TYPE};
use super::PeerId;
use crate::channel_info::is_compatible_channel_name;
use crate::config::{IpcConfig, BINARY_VERSION};
use crate::platform::is_valid_pid;
use crate::{LinkError, Result};
use std::collections::HashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reason codes reported with `ChannelEvent::Error`.
pub mod error_reason {
    /// The other side closed the connection.
    pub const PEER_CLOSED: i32 = 1;
    /// Reading from the socket failed.
    pub const READ_FAILED: i32 = 2;
    /// The hello exchange failed or did not match.
    pub const HANDSHAKE_FAILED: i32 = 3;
    /// Writing to the socket failed.
    pub const WRITE_FAILED: i32 = 4;
}

/// Something that happened on a channel, delivered to its owning peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Handshake completed; carries the other side's process id.
    Connected { peer_pid: u32 },
    /// A non-reply message arrived.
    Message(Message),
    /// A frame could not be understood. The channel stays up.
    BadMessage { reason: String },
    /// The channel is unusable. Emitted at most once, and last.
    Error { reason: i32 },
}

/// Where channels deliver their events.
pub type EventSink = mpsc::UnboundedSender<(PeerId, ChannelEvent)>;

pub(crate) enum Outbound {
    Send(Message),
    Request(Message, oneshot::Sender<Result<Message>>),
}

/// Cloneable handle for writing to a channel from any task.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSender {
    /// Queue a message. Returns false once the channel has failed or closed.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(Outbound::Send(message)).is_ok()
    }

    /// Send a sync message and wait for its reply.
    ///
    /// Fails with `ReplyError` when the other side could not handle the
    /// message and with `ChannelClosed` when the channel goes away first.
    pub async fn send_sync(&self, message: Message) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Request(message, reply_tx))
            .map_err(|_| LinkError::ChannelClosed)?;
        reply_rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One end of a channel. Dropping it tears the connection down.
pub struct Channel {
    id: String,
    sender: ChannelSender,
    driver: Option<JoinHandle<()>>,
}

impl Channel {
    /// Open a host channel and start waiting for the client in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(peer: PeerId, events: EventSink) -> Result<Self> {
        let listener = std::net::TcpListener::bind(IpcConfig::LISTEN_ADDR)
            .map_err(|e| LinkError::io_with_context(e, "Failed to bind host channel"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        let id = format!(
            "{}{sep}{}{sep}{}",
            BINARY_VERSION,
            Uuid::new_v4().simple(),
            port,
            sep = IpcConfig::CHANNEL_NAME_SEPARATOR
        );
        info!("Host channel {} listening on port {}", id, port);

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_id = id.clone();
        let driver = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Channel {} accepted connection from {}", channel_id, addr);
                    // One client per channel.
                    drop(listener);
                    drive(stream, channel_id, peer, events, rx).await;
                }
                Err(e) => {
                    warn!("Channel {} accept failed: {}", channel_id, e);
                    let _ = events.send((
                        peer,
                        ChannelEvent::Error {
                            reason: error_reason::READ_FAILED,
                        },
                    ));
                }
            }
        });

        Ok(Self {
            id,
            sender: ChannelSender { tx },
            driver: Some(driver),
        })
    }

    /// Connect to a host channel by id.
    ///
    /// Returns once the TCP connection is up; the handshake completes in the
    /// background and is reported as `ChannelEvent::Connected`.
    pub async fn connect(channel_id: &str, peer: PeerId, events: EventSink) -> Result<Self> {
        if !is_compatible_channel_name(channel_id) {
            return Err(LinkError::IncompatibleChannel {
                channel_id: channel_id.to_string(),
            });
        }
        let port = parse_port(channel_id)?;

        let stream = tokio::time::timeout(
            IpcConfig::CONNECT_TIMEOUT,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map_err(|_| LinkError::ConnectTimeout {
            channel_id: channel_id.to_string(),
        })?
        .map_err(|e| LinkError::io_with_context(e, format!("Failed to connect to {}", channel_id)))?;

        debug!("Connected to channel {}", channel_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let id = channel_id.to_string();
        let driver = tokio::spawn(drive(stream, id.clone(), peer, events, rx));

        Ok(Self {
            id,
            sender: ChannelSender { tx },
            driver: Some(driver),
        })
    }

    /// A channel with no connection behind it; outbound traffic lands in the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            id: id.to_string(),
            sender: ChannelSender { tx },
            driver: None,
        };
        (channel, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message)
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

fn parse_port(channel_id: &str) -> Result<u16> {
    let invalid = |reason: &str| LinkError::InvalidChannelId {
        channel_id: channel_id.to_string(),
        reason: reason.to_string(),
    };
    let (_, port) = channel_id
        .rsplit_once(IpcConfig::CHANNEL_NAME_SEPARATOR)
        .ok_or_else(|| invalid("missing port"))?;
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))
}

/// Aborts the wrapped task when dropped, so aborting the router also stops
/// its reader.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn drive(
    stream: TcpStream,
    channel_id: String,
    peer: PeerId,
    events: EventSink,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    match handshake(&mut reader, &mut writer, &channel_id).await {
        Ok(peer_pid) => {
            info!("Channel {} connected to process {}", channel_id, peer_pid);
            if events
                .send((peer, ChannelEvent::Connected { peer_pid }))
                .is_err()
            {
                return;
            }
        }
        Err(e) => {
            warn!("Channel {} handshake failed: {}", channel_id, e);
            let _ = events.send((
                peer,
                ChannelEvent::Error {
                    reason: error_reason::HANDSHAKE_FAILED,
                },
            ));
            return;
        }
    }

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let _reader = AbortOnDrop(tokio::spawn(pump_frames(reader, frames_tx)));

    let reason = route(&channel_id, peer, &events, writer, frames_rx, outbound).await;
    if let Some(reason) = reason {
        debug!("Channel {} failed with reason {}", channel_id, reason);
        let _ = events.send((peer, ChannelEvent::Error { reason }));
    }
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    channel_id: &str,
) -> Result<u32> {
    write_message(writer, &Hello::for_channel(channel_id).into_message()?).await?;

    let frame = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| LinkError::ConnectTimeout {
            channel_id: channel_id.to_string(),
        })??
        .ok_or(LinkError::ChannelClosed)?;
    let message: Message = serde_json::from_slice(&frame)?;
    if message.type_id != HELLO_TYPE {
        return Err(ProtocolError::UnknownType {
            type_id: message.type_id,
        }
        .into());
    }

    let hello: Hello = message.payload_as()?;
    if hello.protocol_version != IpcConfig::PROTOCOL_VERSION || hello.channel_id != channel_id {
        return Err(LinkError::IncompatibleChannel {
            channel_id: hello.channel_id,
        });
    }
    if !is_valid_pid(hello.pid) {
        return Err(ProtocolError::Malformed {
            type_id: HELLO_TYPE,
            reason: format!("invalid pid {}", hello.pid),
        }
        .into());
    }
    Ok(hello.pid)
}

async fn pump_frames(mut reader: OwnedReadHalf, frames: mpsc::UnboundedSender<Result<Option<Vec<u8>>>>) {
    loop {
        let result = read_frame(&mut reader).await;
        let done = !matches!(result, Ok(Some(_)));
        if frames.send(result).is_err() || done {
            return;
        }
    }
}

/// Run the connected channel until it fails. Returns the failure reason, or
/// `None` when the owner went away.
async fn route(
    channel_id: &str,
    peer: PeerId,
    events: &EventSink,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Result<Option<Vec<u8>>>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Option<i32> {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Message>>> = HashMap::new();
    let mut next_request_id: u64 = 1;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let frame = match frame {
                    Some(Ok(Some(frame))) => frame,
                    Some(Ok(None)) | None => return Some(error_reason::PEER_CLOSED),
                    Some(Err(e)) => {
                        debug!("Channel {} read error: {}", channel_id, e);
                        return Some(error_reason::READ_FAILED);
                    }
                };

                let event = match serde_json::from_slice::<Message>(&frame) {
                    Ok(message) if message.reply => {
                        match message.request_id.and_then(|id| pending.remove(&id)) {
                            Some(waiter) => {
                                let result = if message.reply_error {
                                    Err(LinkError::ReplyError { type_id: message.type_id })
                                } else {
                                    Ok(message)
                                };
                                let _ = waiter.send(result);
                                continue;
                            }
                            None => ChannelEvent::BadMessage {
                                reason: ProtocolError::UnexpectedReply {
                                    request_id: message.request_id.unwrap_or_default(),
                                }
                                .to_string(),
                            },
                        }
                    }
                    Ok(message) if message.type_id == HELLO_TYPE => ChannelEvent::BadMessage {
                        reason: "duplicate hello".to_string(),
                    },
                    Ok(message) => ChannelEvent::Message(message),
                    Err(e) => ChannelEvent::BadMessage {
                        reason: format!("undecodable frame: {}", e),
                    },
                };
                if events.send((peer, event)).is_err() {
                    return None;
                }
            }
            command = outbound.recv() => {
                let message = match command {
                    Some(Outbound::Send(message)) => message,
                    Some(Outbound::Request(mut message, waiter)) => {
                        let request_id = next_request_id;
                        next_request_id += 1;
                        message.sync = true;
                        message.request_id = Some(request_id);
                        pending.insert(request_id, waiter);
                        message
                    }
                    None => return None,
                };
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!("Channel {} write error: {}", channel_id, e);
                    return Some(error_reason::WRITE_FAILED);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingId;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const HOST: PeerId = PeerId(1);
    const CLIENT: PeerId = PeerId(2);

    async fn next(
        rx: &mut mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
    ) -> (PeerId, ChannelEvent) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event sink closed")
    }

    async fn connected_pair() -> (
        Channel,
        mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
        Channel,
        mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
    ) {
        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();

        let host = Channel::listen(HOST, host_tx).unwrap();
        let client = Channel::connect(host.id(), CLIENT, client_tx).await.unwrap();

        let pid = std::process::id();
        assert_eq!(next(&mut host_rx).await, (HOST, ChannelEvent::Connected { peer_pid: pid }));
        assert_eq!(
            next(&mut client_rx).await,
            (CLIENT, ChannelEvent::Connected { peer_pid: pid })
        );
        (host, host_rx, client, client_rx)
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("0.3.0.abcdef.4567").unwrap(), 4567);
        assert!(parse_port("0.3.0.abcdef.notaport").is_err());
        assert!(parse_port("noseparator").is_err());
    }

    #[tokio::test]
    async fn test_listen_id_is_compatible() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Channel::listen(HOST, tx).unwrap();
        assert!(is_compatible_channel_name(channel.id()));
        assert!(parse_port(channel.id()).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (host, mut host_rx, client, mut client_rx) = connected_pair().await;

        assert!(client.send(Message::new(RoutingId(3), 42)));
        match next(&mut host_rx).await {
            (HOST, ChannelEvent::Message(msg)) => {
                assert_eq!(msg.routing_id, RoutingId(3));
                assert_eq!(msg.type_id, 42);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(host.send(Message::control(7)));
        match next(&mut client_rx).await {
            (CLIENT, ChannelEvent::Message(msg)) => assert_eq!(msg.type_id, 7),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_request_gets_matched_reply() {
        let (host, mut host_rx, client, _client_rx) = connected_pair().await;

        let sender = client.sender();
        let request = tokio::spawn(async move {
            sender
                .send_sync(Message::control(9))
                .await
        });

        let incoming = match next(&mut host_rx).await {
            (_, ChannelEvent::Message(msg)) => msg,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(incoming.sync);
        assert!(incoming.request_id.is_some());
        host.send(incoming.reply_with(serde_json::json!({"ok": true})));

        let reply = request.await.unwrap().unwrap();
        assert!(reply.reply);
        assert_eq!(reply.payload, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_error_reply_fails_request() {
        let (host, mut host_rx, client, _client_rx) = connected_pair().await;

        let sender = client.sender();
        let request = tokio::spawn(async move { sender.send_sync(Message::control(9)).await });

        if let (_, ChannelEvent::Message(msg)) = next(&mut host_rx).await {
            host.send(msg.error_reply());
        }

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::ReplyError { type_id: 9 }));
    }

    #[tokio::test]
    async fn test_peer_close_reports_error_and_fails_pending() {
        let (host, mut host_rx, client, mut client_rx) = connected_pair().await;

        let sender = client.sender();
        let request = tokio::spawn(async move { sender.send_sync(Message::control(9)).await });
        // Wait until the request reached the host, then drop the host.
        let _ = next(&mut host_rx).await;
        drop(host);

        assert_eq!(
            next(&mut client_rx).await,
            (
                CLIENT,
                ChannelEvent::Error {
                    reason: error_reason::PEER_CLOSED
                }
            )
        );
        assert!(matches!(
            request.await.unwrap(),
            Err(LinkError::ChannelClosed)
        ));
        assert!(!client.send(Message::control(1)));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_bad_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Channel::listen(HOST, tx).unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", parse_port(host.id()).unwrap()))
            .await
            .unwrap();
        let hello = Hello::for_channel(host.id()).into_message().unwrap();
        write_message(&mut raw, &hello).await.unwrap();
        assert!(matches!(next(&mut rx).await.1, ChannelEvent::Connected { .. }));

        crate::ipc::protocol::write_frame(&mut raw, b"not json").await.unwrap();
        assert!(matches!(next(&mut rx).await.1, ChannelEvent::BadMessage { .. }));

        let stray = Message::control(5).reply_with(serde_json::Value::Null);
        write_message(&mut raw, &stray).await.unwrap();
        assert!(matches!(next(&mut rx).await.1, ChannelEvent::BadMessage { .. }));

        // Still usable afterwards.
        write_message(&mut raw, &Message::control(6)).await.unwrap();
        assert!(matches!(next(&mut rx).await.1, ChannelEvent::Message(_)));
        raw.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_for_other_channel_fails_handshake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Channel::listen(HOST, tx).unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", parse_port(host.id()).unwrap()))
            .await
            .unwrap();
        let hello = Hello::for_channel("0.0.0.other.1").into_message().unwrap();
        write_message(&mut raw, &hello).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            (
                HOST,
                ChannelEvent::Error {
                    reason: error_reason::HANDSHAKE_FAILED
                }
            )
        );
    }

    #[tokio::test]
    async fn test_hello_with_unusable_pid_fails_handshake() {
        for pid in [0, u32::MAX] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let host = Channel::listen(HOST, tx).unwrap();

            let mut raw = TcpStream::connect(("127.0.0.1", parse_port(host.id()).unwrap()))
                .await
                .unwrap();
            let mut hello = Hello::for_channel(host.id());
            hello.pid = pid;
            write_message(&mut raw, &hello.into_message().unwrap())
                .await
                .unwrap();

            assert_eq!(
                next(&mut rx).await,
                (
                    HOST,
                    ChannelEvent::Error {
                        reason: error_reason::HANDSHAKE_FAILED
                    }
                )
            );
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_version() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = Channel::connect("0.0.0-stale.abc.1234", CLIENT, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::IncompatibleChannel { .. }));
    }

    #[tokio::test]
    async fn test_detached_channel_captures_outbound() {
        let (channel, mut rx) = Channel::detached("test");
        assert!(channel.send(Message::control(3)));
        match rx.recv().await {
            Some(Outbound::Send(msg)) => assert_eq!(msg.type_id, 3),
            _ => panic!("expected a plain send"),
        }
    }
}
