//! Connection-oriented semantics on top of a connectionless publish/subscribe transport.
//!
//! A [ConnectedTopics] instance owns connected sources and receivers. Whenever the transport
//!  attaches a source to a receiver on the same topic, the two run a handshake that establishes a
//!  connection: both sides get exactly one connect callback with the peer's metadata and the
//!  sequence number at which the connection starts, and at most one disconnect callback when it
//!  ends, however the underlying control messages are lost, delayed or duplicated.

pub mod config;
pub mod connected_topics;
pub mod context;
pub mod controller;
pub mod handshake;
pub mod listener;
pub mod peer_info;
pub mod receiver;
pub mod source;
pub mod transport;
pub mod util;
pub mod test_util;

pub use config::{CtConfig, TestBits};
pub use connected_topics::ConnectedTopics;
pub use listener::{ConnClientData, DeliveredMessage, ReceiverListener, SourceListener};
pub use peer_info::{ConnStatus, PeerInfo};
pub use receiver::ct_receiver::ConnectedReceiver;
pub use source::ct_source::ConnectedSource;
