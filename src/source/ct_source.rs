use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::controller::command::SourceId;
use crate::handshake::conn_end::ConnEnd;
use crate::listener::SourceListener;
use crate::transport::TopicSource;

/// Controller-side state of a connected source
pub struct CtSource {
    pub id: SourceId,
    pub topic: String,
    pub metadata: Bytes,
    pub listener: Arc<dyn SourceListener>,
    pub transport_source: Arc<dyn TopicSource>,
    /// keys of this source's connections
    pub conns: BTreeSet<ConnEnd>,
    pub exiting: bool,
}

/// Application handle for a connected source. Data is sent directly on the transport, everything
///  else goes through [crate::ConnectedTopics].
pub struct ConnectedSource {
    pub(crate) id: SourceId,
    topic: String,
    transport_source: Arc<dyn TopicSource>,
}

impl Debug for ConnectedSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectedSource{{id:{}, topic:{:?}}}", self.id, self.topic)
    }
}

impl ConnectedSource {
    pub(crate) fn new(id: SourceId, topic: String, transport_source: Arc<dyn TopicSource>) -> ConnectedSource {
        ConnectedSource { id, topic, transport_source }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// the transport's name for this source, as receivers see it
    pub fn source_name(&self) -> String {
        self.transport_source.source_name()
    }

    pub async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        self.transport_source.send(data, false).await
    }
}
