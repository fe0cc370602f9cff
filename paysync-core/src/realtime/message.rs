//! Inbound realtime messages and where they are delivered.

use crate::protocol::ChannelFrame;
use async_trait::async_trait;

/// A decoded server → device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    NewOrder(serde_json::Value),
    OrderUpdate(serde_json::Value),
    SyncRequest,
    Ping(Option<i64>),
    /// A type this device does not know. Ignored.
    Unknown(String),
}

impl ChannelEvent {
    /// Decode a text frame. Returns `None` for frames that are not JSON
    /// channel frames at all.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: ChannelFrame = serde_json::from_str(text).ok()?;
        Some(Self::from_frame(frame))
    }

    pub fn from_frame(frame: ChannelFrame) -> Self {
        match frame.kind.as_str() {
            ChannelFrame::NEW_ORDER => Self::NewOrder(frame.data),
            ChannelFrame::ORDER_UPDATE => Self::OrderUpdate(frame.data),
            ChannelFrame::SYNC_REQUEST => Self::SyncRequest,
            ChannelFrame::PING => Self::Ping(frame.timestamp),
            _ => Self::Unknown(frame.kind),
        }
    }

    /// Whether the event needs a delta pull (and a reconcile after it).
    pub fn wants_pull(&self) -> bool {
        matches!(self, Self::NewOrder(_) | Self::OrderUpdate(_) | Self::SyncRequest)
    }
}

/// Receives realtime events for one server.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: ChannelEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_types() {
        let event = ChannelEvent::parse(r#"{"type":"new_order","data":{"id":4}}"#).unwrap();
        assert_eq!(event, ChannelEvent::NewOrder(serde_json::json!({"id": 4})));
        assert!(event.wants_pull());

        let event = ChannelEvent::parse(r#"{"type":"order_update","data":{}}"#).unwrap();
        assert!(event.wants_pull());

        assert_eq!(
            ChannelEvent::parse(r#"{"type":"sync_request"}"#),
            Some(ChannelEvent::SyncRequest)
        );
        assert_eq!(
            ChannelEvent::parse(r#"{"type":"ping","timestamp":9}"#),
            Some(ChannelEvent::Ping(Some(9)))
        );
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let event = ChannelEvent::parse(r#"{"type":"promo","data":{"x":1}}"#).unwrap();
        assert_eq!(event, ChannelEvent::Unknown("promo".into()));
        assert!(!event.wants_pull());
    }

    #[test]
    fn garbage_is_dropped() {
        assert!(ChannelEvent::parse("not json").is_none());
        assert!(ChannelEvent::parse(r#"{"data":{}}"#).is_none());
    }
}
