//! Listener capability and the dispatch rules both peer variants share.

use super::protocol::{Message, ProtocolError};
use tracing::{debug, error};

/// What a listener did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Processed; a sync sender gets an empty reply.
    Handled,
    /// Processed; a sync sender gets this payload.
    Reply(serde_json::Value),
    /// Not a message this listener understands; a sync sender gets an error
    /// reply.
    Unhandled,
}

/// Handler for the messages addressed to one routing id.
///
/// `Context` is what the owning peer lends the listener while it runs: the
/// profile manager on the host, the channel sender on a client.
pub trait Listener: Send {
    type Context: ?Sized;

    fn on_message_received(
        &mut self,
        message: &Message,
        ctx: &mut Self::Context,
    ) -> Result<Dispatch, ProtocolError>;

    /// Called when a message for this listener could not be decoded.
    fn on_bad_message_received(&mut self, message: &Message, err: &ProtocolError) {
        error!(
            "Bad message for routing_id({}): {}",
            message.routing_id, err
        );
    }

    /// Called after the route was removed from its table, either by an
    /// explicit teardown or because the channel went away.
    fn on_route_removed(&mut self, _ctx: &mut Self::Context) {}
}

/// Deliver a routed message to `listener`, or treat it as a routing miss.
pub(crate) fn deliver<C: ?Sized>(
    listener: Option<&mut Box<dyn Listener<Context = C>>>,
    message: &Message,
    ctx: &mut C,
) -> Result<Dispatch, ProtocolError> {
    match listener {
        Some(listener) => {
            let result = listener.on_message_received(message, ctx);
            if let Err(err) = &result {
                listener.on_bad_message_received(message, err);
            }
            result
        }
        None => {
            // Expected when an object is torn down while messages are in flight.
            debug!(
                "No route for message type {:#x} to routing_id({})",
                message.type_id, message.routing_id
            );
            Ok(Dispatch::Unhandled)
        }
    }
}

/// The reply owed to the sender of `message`, if it was synchronous.
///
/// Every sync message gets exactly one reply: a success reply when it was
/// handled, an error reply in every other case.
pub(crate) fn reply_for(
    message: &Message,
    outcome: &Result<Dispatch, ProtocolError>,
) -> Option<Message> {
    if !message.sync {
        return None;
    }
    let reply = match outcome {
        Ok(Dispatch::Handled) => message.reply_with(serde_json::Value::Null),
        Ok(Dispatch::Reply(payload)) => message.reply_with(payload.clone()),
        Ok(Dispatch::Unhandled) | Err(_) => message.error_reply(),
    };
    Some(reply)
}
