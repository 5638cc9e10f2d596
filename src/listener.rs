use std::any::Any;

use bytes::Bytes;

use crate::peer_info::PeerInfo;

/// Application state attached to a single connection. It is returned from a connect callback and
///  handed back with every message and with the disconnect callback.
pub type ConnClientData = Box<dyn Any + Send + Sync>;

/// Callbacks for a connected source. They are called from the controller task, so they should
///  return promptly.
pub trait SourceListener: Send + Sync + 'static {
    fn on_connect(&self, peer: &PeerInfo) -> Option<ConnClientData>;

    /// Called at most once per connection, and only if [SourceListener::on_connect] was called
    ///  for it before.
    fn on_disconnect(&self, peer: &PeerInfo, client_data: Option<ConnClientData>);
}

/// Callbacks for a connected receiver. [ReceiverListener::on_message] is called from the
///  transport's delivery task, in sequence order per source; the connect and disconnect callbacks
///  are ordered with respect to the messages of the same connection.
pub trait ReceiverListener: Send + Sync + 'static {
    fn on_connect(&self, peer: &PeerInfo) -> Option<ConnClientData>;

    fn on_message(&self, msg: &DeliveredMessage, client_data: Option<&ConnClientData>);

    fn on_disconnect(&self, peer: &PeerInfo, client_data: Option<ConnClientData>);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeliveredMessage {
    pub topic: String,
    pub source_name: String,
    pub sequence_number: u32,
    pub data: Bytes,
    /// Handshake messages occupy sequence numbers on the data stream and are delivered flagged
    ///  rather than hidden, so the application sees a gap-free sequence.
    pub is_handshake: bool,
}
