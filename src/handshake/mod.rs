//! The handshake wire format: connection keys and the six handshake messages.

pub mod conn_end;
pub mod handshake_messages;

/// Topic on which handshake messages are exchanged out of band. Handshake messages on a data
///  stream carry a marker instead, so they never collide with application data.
pub const HANDSHAKE_TOPIC: &str = "CtHandshake";
