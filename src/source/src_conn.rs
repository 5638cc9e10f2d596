use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::config::TestBits;
use crate::context::CtContext;
use crate::controller::command::{Command, SourceId};
use crate::handshake::conn_end::ConnEnd;
use crate::handshake::handshake_messages::{ConnectResponseData, DisconnectData, HandshakeMessage};
use crate::listener::{ConnClientData, SourceListener};
use crate::peer_info::{ConnState, ConnStatus, PeerInfo};
use crate::transport::TopicSource;
use crate::util::retry_timer::RetryTimer;

/// The source side of a connection. Owned by the controller, keyed by the receiver's half.
pub struct SrcConn {
    pub source_id: SourceId,
    pub rcv: ConnEnd,
    pub src: ConnEnd,
    pub state: ConnState,
    pub try_cnt: u32,
    timer: RetryTimer,
    pub pending_tmr_id: Option<u32>,
    pub peer_info: PeerInfo,
    connect_called: bool,
    disconnect_called: bool,
    client_data: Option<ConnClientData>,
}

impl SrcConn {
    pub fn new(source_id: SourceId, rcv: ConnEnd, src: ConnEnd, metadata: Bytes) -> SrcConn {
        SrcConn {
            source_id,
            rcv,
            src,
            state: ConnState::Starting,
            try_cnt: 0,
            timer: RetryTimer::new(),
            pending_tmr_id: None,
            peer_info: PeerInfo {
                status: ConnStatus::Ok,
                src_metadata: Some(metadata),
                ..Default::default()
            },
            connect_called: false,
            disconnect_called: false,
            client_data: None,
        }
    }

    pub fn set_state(&mut self, ctx: &CtContext, state: ConnState) {
        if self.state != state {
            debug!("source connection {:?}: {:?} -> {:?}", self.rcv, self.state, state);
            ctx.record_event(|| format!("src conn {:?} {:?} -> {:?}", self.rcv, self.state, state));
            self.state = state;
        }
    }

    pub async fn send_connect_response(&self, ctx: &CtContext, transport_source: &Arc<dyn TopicSource>) -> anyhow::Result<()> {
        if ctx.config.is_suppressed(TestBits::NO_CRSP) {
            debug!("suppressing CRSP to {:?}", self.rcv);
            return Ok(());
        }

        let msg = HandshakeMessage::ConnectResponse(ConnectResponseData {
            rcv: self.rcv,
            src: self.src,
            metadata: self.peer_info.src_metadata.clone().unwrap_or_default(),
        });
        transport_source.send(&msg.to_bytes(), true).await
    }

    pub async fn send_disconnect_response(&self, ctx: &CtContext, transport_source: &Arc<dyn TopicSource>) -> anyhow::Result<()> {
        if ctx.config.is_suppressed(TestBits::NO_DRSP) {
            debug!("suppressing DRSP to {:?}", self.rcv);
            return Ok(());
        }

        let msg = HandshakeMessage::DisconnectResponse(DisconnectData {
            rcv: self.rcv,
            src: self.src,
        });
        transport_source.send(&msg.to_bytes(), true).await
    }

    pub fn schedule_tick(&mut self, ctx: &CtContext, delay: Duration) -> anyhow::Result<()> {
        let controller = ctx.controller.clone();
        let key = self.rcv;
        let tmr_id = self.timer.schedule(delay, move |tmr_id| {
            controller.submit_nowait(Command::SrcConnTick { key, tmr_id });
        })?;
        self.pending_tmr_id = Some(tmr_id);
        Ok(())
    }

    /// After this returns, no tick from a previous schedule is accepted any more
    pub async fn cancel_timer(&mut self) {
        self.pending_tmr_id = None;
        self.timer.cancel_sync().await;
    }

    pub fn notify_connect(&mut self, listener: &Arc<dyn SourceListener>) {
        if self.connect_called {
            return;
        }
        self.connect_called = true;
        self.client_data = listener.on_connect(&self.peer_info);
    }

    /// only notifies if the application was notified about the connection in the first place
    pub fn notify_disconnect(&mut self, listener: &Arc<dyn SourceListener>) {
        if !self.connect_called || self.disconnect_called {
            return;
        }
        self.disconnect_called = true;
        listener.on_disconnect(&self.peer_info, self.client_data.take());
    }
}
