//! Utilities for testing code based on connected topics. They are used by this crate's own tests,
//!  and they are exported so applications can use them for their tests against the
//!  [crate::transport::loopback] transport.

use std::sync::{Arc, Mutex};

use crate::listener::{ConnClientData, DeliveredMessage, ReceiverListener, SourceListener};
use crate::peer_info::PeerInfo;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenerEvent {
    Connect(PeerInfo),
    /// the message, and the client data that was handed back with it
    Message(DeliveredMessage, Option<usize>),
    Disconnect(PeerInfo, Option<usize>),
}

/// A listener for both sources and receivers that records all callbacks in order. The client data
///  it returns from each connect callback is the number of that callback, starting at 1.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<RecordingListener> {
        Default::default()
    }

    fn record(&self, event: ListenerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn record_connect(&self, peer: &PeerInfo) -> Option<ConnClientData> {
        let mut events = self.events.lock().ok()?;
        events.push(ListenerEvent::Connect(peer.clone()));
        let num_connects = events.iter()
            .filter(|e| matches!(e, ListenerEvent::Connect(_)))
            .count();
        Some(Box::new(num_connects))
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn connects(&self) -> Vec<PeerInfo> {
        self.events().into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Connect(peer) => Some(peer),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<PeerInfo> {
        self.events().into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Disconnect(peer, _) => Some(peer),
                _ => None,
            })
            .collect()
    }

    /// delivered messages without handshakes
    pub fn data_messages(&self) -> Vec<DeliveredMessage> {
        self.events().into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Message(msg, _) if !msg.is_handshake => Some(msg),
                _ => None,
            })
            .collect()
    }
}

fn client_data_number(client_data: Option<&ConnClientData>) -> Option<usize> {
    client_data
        .and_then(|d| d.downcast_ref::<usize>())
        .copied()
}

impl SourceListener for RecordingListener {
    fn on_connect(&self, peer: &PeerInfo) -> Option<ConnClientData> {
        self.record_connect(peer)
    }

    fn on_disconnect(&self, peer: &PeerInfo, client_data: Option<ConnClientData>) {
        self.record(ListenerEvent::Disconnect(peer.clone(), client_data_number(client_data.as_ref())));
    }
}

impl ReceiverListener for RecordingListener {
    fn on_connect(&self, peer: &PeerInfo) -> Option<ConnClientData> {
        self.record_connect(peer)
    }

    fn on_message(&self, msg: &DeliveredMessage, client_data: Option<&ConnClientData>) {
        self.record(ListenerEvent::Message(msg.clone(), client_data_number(client_data)));
    }

    fn on_disconnect(&self, peer: &PeerInfo, client_data: Option<ConnClientData>) {
        self.record(ListenerEvent::Disconnect(peer.clone(), client_data_number(client_data.as_ref())));
    }
}
