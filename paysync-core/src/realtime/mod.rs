//! Realtime push channel with reconnect/backoff and a polling backstop.

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod message;
pub mod supervisor;

pub use backoff::Backoff;
pub use channel::{ChannelSettings, RealtimeChannel};
pub use connection::{ConnectionBoard, ConnectionState, DeviceConnection};
pub use message::{ChannelEvent, EventSink};
pub use supervisor::{RealtimeSupervisor, ServerRegistry, SupervisorSettings};
