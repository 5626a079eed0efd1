//! Envelope-directive prefix and the internal work-item/response shapes.
//!
//! Implements spec.md section 9's design note: "Model as an enum
//! `Reply { None, Envelope(routing_id, delimiter) }` prepended to the
//! worker's input message; removes special-casing." Here it's a
//! first-class enum carrying the channel a worker replies on directly,
//! since tokio tasks don't share a socket the way a single external ROUTER
//! socket would (see `router::MainRouter` for how responses reach the
//! wire).

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// A message ready to be written back to an external connection: the
/// routing envelope (if the connection is router-role) followed by the
/// response's own frames.
pub type OutgoingMessage = Vec<Frame>;

/// How (or whether) a worker should reply to a request.
#[derive(Clone)]
pub enum Reply {
    /// Fire-and-forget: the request came in on a PULL-role socket, or was
    /// async on the router role. Nothing is written back.
    None,
    /// Reply by sending frames on this connection's outbound channel,
    /// prefixed with its routing id and an empty delimiter frame — the
    /// envelope spec.md section 6 describes for router-role messages.
    Envelope(ReplyChannel),
}

#[derive(Clone)]
pub struct ReplyChannel {
    pub routing_id: Bytes,
    pub sender: mpsc::Sender<OutgoingMessage>,
}

impl Reply {
    /// Sends `frames` back to the client, prefixed with the routing
    /// envelope if one is present. A closed channel (client disconnected)
    /// is silently dropped — by the time a reply is ready the client may
    /// already be gone, which is not itself an error at the worker scope.
    pub async fn send(&self, frames: Vec<Frame>) {
        if let Reply::Envelope(channel) = self {
            let mut message = Vec::with_capacity(frames.len() + 2);
            message.push(Frame::new(channel.routing_id.clone(), true));
            message.push(Frame::new(Bytes::new(), true));
            message.extend(frames);
            let _ = channel.sender.send(message).await;
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Reply::None)
    }
}

/// One request dispatched from the Main Router to a worker pool's shared
/// inbound channel.
pub struct WorkItem {
    pub reply: Reply,
    /// The header frame followed by whatever payload frames the request
    /// carried, in wire order.
    pub frames: Vec<Frame>,
}

impl WorkItem {
    /// The shutdown sentinel every worker pool recognizes: an item with no
    /// frames at all (spec.md section 5, "Cancellation & timeouts").
    pub fn shutdown() -> WorkItem {
        WorkItem {
            reply: Reply::None,
            frames: Vec::new(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_none_drops_frames_silently() {
        let reply = Reply::None;
        reply.send(vec![Frame::last(Bytes::from_static(b"x"))]).await;
    }

    #[tokio::test]
    async fn reply_envelope_prefixes_routing_id_and_delimiter() {
        let (tx, mut rx) = mpsc::channel(1);
        let reply = Reply::Envelope(ReplyChannel {
            routing_id: Bytes::from_static(b"conn-1"),
            sender: tx,
        });
        reply.send(vec![Frame::last(Bytes::from_static(b"payload"))]).await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.len(), 3);
        assert_eq!(&message[0].data[..], b"conn-1");
        assert!(message[1].data.is_empty());
        assert_eq!(&message[2].data[..], b"payload");
    }

    #[test]
    fn shutdown_sentinel_is_recognized() {
        assert!(WorkItem::shutdown().is_shutdown());
        assert!(!WorkItem {
            reply: Reply::None,
            frames: vec![Frame::last(Bytes::from_static(b"x"))],
        }
        .is_shutdown());
    }
}
