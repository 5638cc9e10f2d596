//! The publish/subscribe transport that connections are layered on. It is deliberately narrow:
//!  topic sources and receivers, per-source attach / detach notifications on the receiving side,
//!  and best-effort out-of-band messages addressed to a process.
//!
//! [loopback] is an in-memory implementation for tests and local experiments.

pub mod loopback;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::handshake::conn_end::UimAddr;

/// Target of an out-of-band message: either a process address, or whichever process currently
///  owns the named source.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Destination {
    Addr(UimAddr),
    Source(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceivedKind {
    Data,
    BeginningOfStream,
    EndOfStream,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub kind: ReceivedKind,
    pub topic: String,
    pub source_name: String,
    pub sequence_number: u32,
    pub data: Bytes,
    /// set by the sender for handshake messages travelling on the data stream
    pub is_handshake: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// where this process receives out-of-band messages
    fn local_addr(&self) -> UimAddr;

    async fn create_source(&self, topic: &str) -> anyhow::Result<Arc<dyn TopicSource>>;

    /// The handler is notified for every source that is discovered on the topic, and the
    ///  returned session receives that source's messages and its eventual detach.
    async fn create_receiver(&self, topic: &str, handler: Arc<dyn SourceNotifyHandler>) -> anyhow::Result<Arc<dyn TopicReceiver>>;

    /// Receive out-of-band messages sent to this process for a given topic
    async fn listen_immediate(&self, topic: &str, handler: Arc<dyn ImmediateHandler>) -> anyhow::Result<Arc<dyn TopicReceiver>>;

    /// Best effort: a message to an address without a listener is silently dropped, but a source
    ///  name that can not be resolved is an error.
    async fn send_immediate(&self, to: &Destination, topic: &str, buf: &[u8]) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopicSource: Send + Sync + 'static {
    fn source_name(&self) -> String;

    async fn send(&self, buf: &[u8], is_handshake: bool) -> anyhow::Result<()>;

    async fn delete(&self) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopicReceiver: Send + Sync + 'static {
    /// Detaches all sources (notifying their sessions) and stops delivery
    async fn delete(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SourceNotifyHandler: Send + Sync + 'static {
    async fn on_source_attached(&self, source_name: &str) -> Arc<dyn SourceSession>;
}

#[async_trait]
pub trait SourceSession: Send + Sync + 'static {
    async fn on_message(&self, msg: ReceivedMessage);

    async fn on_source_detached(&self);
}

#[async_trait]
pub trait ImmediateHandler: Send + Sync + 'static {
    async fn on_immediate(&self, buf: Bytes);
}
