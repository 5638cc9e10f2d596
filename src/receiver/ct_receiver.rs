use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::CtContext;
use crate::controller::command::{Command, ReceiverId};
use crate::listener::ReceiverListener;
use crate::receiver::rcv_conn::{RcvConn, RcvSession};
use crate::transport::{SourceNotifyHandler, SourceSession, TopicReceiver};

/// The parts of a connected receiver that its connections need on the delivery task
pub struct RcvShared {
    pub receiver_id: ReceiverId,
    pub topic: String,
    pub metadata: Bytes,
    pub listener: Arc<dyn ReceiverListener>,
    pub ctx: Arc<CtContext>,
}

/// Controller-side state of a connected receiver
pub struct CtReceiver {
    pub shared: Arc<RcvShared>,
    /// taken when the receiver is torn down, or when it is exiting and only waits for its
    ///  connections' detach notifications
    pub transport_receiver: Option<Arc<dyn TopicReceiver>>,
    pub conns: Vec<Arc<RcvConn>>,
    pub exiting: bool,
}

pub struct RcvNotifyHandler {
    pub shared: Arc<RcvShared>,
}

#[async_trait]
impl SourceNotifyHandler for RcvNotifyHandler {
    async fn on_source_attached(&self, source_name: &str) -> Arc<dyn SourceSession> {
        let conn = Arc::new(RcvConn::new(self.shared.clone(), source_name));
        self.shared.ctx.controller.submit_nowait(Command::RcvConnCreate(conn.clone()));
        Arc::new(RcvSession { conn })
    }
}

/// Application handle for a connected receiver
#[derive(Debug)]
pub struct ConnectedReceiver {
    pub(crate) id: ReceiverId,
    topic: String,
}

impl ConnectedReceiver {
    pub(crate) fn new(id: ReceiverId, topic: String) -> ConnectedReceiver {
        ConnectedReceiver { id, topic }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
