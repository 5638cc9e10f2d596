use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::TestBits;
use crate::controller::command::Command;
use crate::handshake::conn_end::ConnEnd;
use crate::handshake::handshake_messages::{ConnectOkData, ConnectRequestData, ConnectResponseData, DisconnectData, DisconnectOkData, HandshakeMessage};
use crate::handshake::HANDSHAKE_TOPIC;
use crate::listener::{ConnClientData, DeliveredMessage, ReceiverListener};
use crate::peer_info::{ConnState, PeerInfo};
use crate::receiver::ct_receiver::RcvShared;
use crate::transport::{Destination, ReceivedKind, ReceivedMessage, SourceSession};
use crate::util::retry_timer::RetryTimer;

/// The receiving side of a connection, one per source the transport attached to a connected
///  receiver.
///
/// Both the controller and the transport's delivery task work on it, so the mutable part is behind
///  a lock. The delivery task handles connect and disconnect responses in line with the data
///  stream; replies to them are sent by the controller.
pub struct RcvConn {
    pub shared: Arc<RcvShared>,
    source_name: String,
    pub inner: Mutex<RcvConnInner>,
}

pub struct RcvConnInner {
    /// assigned when the connection leaves `PreCreated`
    pub conn_id: Option<u32>,
    pub state: ConnState,
    pub try_cnt: u32,
    pub curr_creq_timeout: Duration,
    timer: RetryTimer,
    pub pending_tmr_id: Option<u32>,
    /// the source's half, known once a connect or disconnect response arrived
    pub src: Option<ConnEnd>,
    pub peer_info: PeerInfo,
    connect_called: bool,
    disconnect_called: bool,
    client_data: Option<ConnClientData>,
}

impl RcvConnInner {
    fn new() -> RcvConnInner {
        RcvConnInner {
            conn_id: None,
            state: ConnState::PreCreated,
            try_cnt: 0,
            curr_creq_timeout: Duration::ZERO,
            timer: RetryTimer::new(),
            pending_tmr_id: None,
            src: None,
            peer_info: PeerInfo::default(),
            connect_called: false,
            disconnect_called: false,
            client_data: None,
        }
    }

    pub async fn cancel_timer(&mut self) {
        self.pending_tmr_id = None;
        self.timer.cancel_sync().await;
    }

    pub fn notify_connect(&mut self, listener: &Arc<dyn ReceiverListener>) {
        if self.connect_called {
            return;
        }
        self.connect_called = true;
        self.client_data = listener.on_connect(&self.peer_info);
    }

    pub fn notify_disconnect(&mut self, listener: &Arc<dyn ReceiverListener>) {
        if !self.connect_called || self.disconnect_called {
            return;
        }
        self.disconnect_called = true;
        listener.on_disconnect(&self.peer_info, self.client_data.take());
    }
}

impl RcvConn {
    pub fn new(shared: Arc<RcvShared>, source_name: &str) -> RcvConn {
        RcvConn {
            shared,
            source_name: source_name.to_string(),
            inner: Mutex::new(RcvConnInner::new()),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn set_state(&self, inner: &mut RcvConnInner, state: ConnState) {
        if inner.state != state {
            debug!("receiver connection to {}: {:?} -> {:?}", self.source_name, inner.state, state);
            self.shared.ctx.record_event(|| format!("rcv conn {} {:?} -> {:?}", self.source_name, inner.state, state));
            inner.state = state;
        }
    }

    pub fn schedule_tick(self: &Arc<Self>, inner: &mut RcvConnInner, delay: Duration) -> anyhow::Result<()> {
        let controller = self.shared.ctx.controller.clone();
        let conn = Arc::downgrade(self);
        let tmr_id = inner.timer.schedule(delay, move |tmr_id| {
            controller.submit_nowait(Command::RcvConnTick { conn, tmr_id });
        })?;
        inner.pending_tmr_id = Some(tmr_id);
        Ok(())
    }

    fn rcv_end(&self, inner: &RcvConnInner) -> anyhow::Result<ConnEnd> {
        inner.conn_id
            .map(|conn_id| self.shared.ctx.conn_end(conn_id))
            .ok_or_else(|| anyhow!("connection to {} has no id yet", self.source_name))
    }

    fn src_end(&self, inner: &RcvConnInner) -> anyhow::Result<ConnEnd> {
        inner.src
            .ok_or_else(|| anyhow!("source end of connection to {} is not known", self.source_name))
    }

    /// Requests go to whichever process owns the source, the transport resolves it by name
    pub async fn send_connect_request(&self, inner: &RcvConnInner) -> anyhow::Result<()> {
        let ctx = &self.shared.ctx;
        if ctx.config.is_suppressed(TestBits::NO_CREQ) {
            debug!("suppressing CREQ to {}", self.source_name);
            return Ok(());
        }

        let msg = HandshakeMessage::ConnectRequest(ConnectRequestData {
            rcv: self.rcv_end(inner)?,
            topic: self.shared.topic.clone(),
        });
        ctx.transport.send_immediate(&Destination::Source(self.source_name.clone()), HANDSHAKE_TOPIC, &msg.to_bytes()).await
    }

    pub async fn send_connect_ok(&self, inner: &RcvConnInner) -> anyhow::Result<()> {
        let ctx = &self.shared.ctx;
        if ctx.config.is_suppressed(TestBits::NO_COK) {
            debug!("suppressing C_OK to {}", self.source_name);
            return Ok(());
        }

        let src = self.src_end(inner)?;
        let msg = HandshakeMessage::ConnectOk(ConnectOkData {
            rcv: self.rcv_end(inner)?,
            src,
            start_seq_num: inner.peer_info.rcv_start_seq_num.unwrap_or_default(),
            metadata: self.shared.metadata.clone(),
        });
        ctx.transport.send_immediate(&Destination::Addr(src.uim_addr), HANDSHAKE_TOPIC, &msg.to_bytes()).await
    }

    pub async fn send_disconnect_request(&self, inner: &RcvConnInner) -> anyhow::Result<()> {
        let ctx = &self.shared.ctx;
        if ctx.config.is_suppressed(TestBits::NO_DREQ) {
            debug!("suppressing DREQ to {}", self.source_name);
            return Ok(());
        }

        let src = self.src_end(inner)?;
        let msg = HandshakeMessage::DisconnectRequest(DisconnectData {
            rcv: self.rcv_end(inner)?,
            src,
        });
        ctx.transport.send_immediate(&Destination::Addr(src.uim_addr), HANDSHAKE_TOPIC, &msg.to_bytes()).await
    }

    pub async fn send_disconnect_ok(&self, inner: &RcvConnInner) -> anyhow::Result<()> {
        let ctx = &self.shared.ctx;
        if ctx.config.is_suppressed(TestBits::NO_DOK) {
            debug!("suppressing D_OK to {}", self.source_name);
            return Ok(());
        }

        let src = self.src_end(inner)?;
        let msg = HandshakeMessage::DisconnectOk(DisconnectOkData {
            rcv: self.rcv_end(inner)?,
            src,
            end_seq_num: inner.peer_info.rcv_end_seq_num.unwrap_or_default(),
        });
        ctx.transport.send_immediate(&Destination::Addr(src.uim_addr), HANDSHAKE_TOPIC, &msg.to_bytes()).await
    }

    fn deliver(&self, inner: &RcvConnInner, msg: &ReceivedMessage) {
        self.shared.listener.on_message(&DeliveredMessage {
            topic: msg.topic.clone(),
            source_name: msg.source_name.clone(),
            sequence_number: msg.sequence_number,
            data: msg.data.clone(),
            is_handshake: msg.is_handshake,
        }, inner.client_data.as_ref());
    }

    fn is_delivering(&self, inner: &RcvConnInner) -> bool {
        matches!(inner.state, ConnState::Running | ConnState::Ending) || self.shared.ctx.config.pre_delivery
    }

    pub async fn on_message(self: &Arc<Self>, msg: ReceivedMessage) {
        let mut inner = self.inner.lock().await;

        if inner.state == ConnState::PreCreated {
            trace!("connection to {} is not started yet - ignoring message #{}", self.source_name, msg.sequence_number);
            return;
        }
        if msg.kind != ReceivedKind::Data {
            trace!("{:?} from {}", msg.kind, self.source_name);
            return;
        }

        if !msg.is_handshake {
            if self.is_delivering(&inner) {
                self.deliver(&inner, &msg);
            }
            return;
        }

        let handshake = match HandshakeMessage::deser(&msg.data) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("malformed handshake message #{} from {}: {} - dropping", msg.sequence_number, self.source_name, e);
                return;
            }
        };

        // the data stream carries handshakes for all of the source's connections
        let is_own = self.rcv_end(&inner)
            .map(|rcv| *handshake.rcv() == rcv)
            .unwrap_or(false);

        match handshake {
            HandshakeMessage::ConnectResponse(data) if is_own => {
                self.on_connect_response(&mut inner, data, msg.sequence_number).await;
                if inner.state == ConnState::Running {
                    self.deliver(&inner, &msg);
                }
            }
            HandshakeMessage::DisconnectResponse(data) if is_own && inner.src.map_or(true, |src| src == data.src) => {
                if matches!(inner.state, ConnState::Running | ConnState::Ending) {
                    self.deliver(&inner, &msg);
                }
                self.on_disconnect_response(&mut inner, data, msg.sequence_number).await;
            }
            _ => {
                if self.is_delivering(&inner) {
                    self.deliver(&inner, &msg);
                }
            }
        }
    }

    async fn on_connect_response(self: &Arc<Self>, inner: &mut RcvConnInner, data: ConnectResponseData, sequence_number: u32) {
        match inner.state {
            ConnState::Starting => {
                inner.src = Some(data.src);
                inner.peer_info.src_metadata = Some(data.metadata);
                inner.peer_info.rcv_start_seq_num = Some(sequence_number);
                self.set_state(inner, ConnState::Running);
                inner.cancel_timer().await;
                info!("connected to source {} for topic {:?}", self.source_name, self.shared.topic);
                inner.notify_connect(&self.shared.listener);
            }
            ConnState::Running if inner.src == Some(data.src) => {
                // the source did not get our connect ok
                debug!("duplicate connect response from {}", self.source_name);
            }
            other => {
                debug!("connect response from {} in state {:?} - ignoring", self.source_name, other);
                return;
            }
        }

        self.shared.ctx.controller.submit_nowait(Command::RcvSendConnectOk(Arc::downgrade(self)));
    }

    async fn on_disconnect_response(self: &Arc<Self>, inner: &mut RcvConnInner, data: DisconnectData, sequence_number: u32) {
        match inner.state {
            ConnState::Starting | ConnState::Running | ConnState::Ending => {
                if inner.peer_info.rcv_end_seq_num.is_none() {
                    inner.peer_info.rcv_end_seq_num = Some(sequence_number);
                }
                if inner.src.is_none() {
                    inner.src = Some(data.src);
                }
                self.set_state(inner, ConnState::TimeWait);
                inner.cancel_timer().await;
                info!("disconnected from source {} for topic {:?}", self.source_name, self.shared.topic);
                inner.notify_disconnect(&self.shared.listener);
            }
            ConnState::TimeWait => {
                debug!("duplicate disconnect response from {}", self.source_name);
            }
            other => {
                warn!("disconnect response from {} in state {:?} - ignoring", self.source_name, other);
                return;
            }
        }

        self.shared.ctx.controller.submit_nowait(Command::RcvSendDisconnectOk(Arc::downgrade(self)));
    }

    pub async fn on_source_detached(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.pending_tmr_id = None;
            inner.timer.cancel();
        }
        self.shared.ctx.controller.submit_nowait(Command::RcvConnDelete(self.clone()));
    }
}

/// The transport's view of a receiver connection
pub struct RcvSession {
    pub conn: Arc<RcvConn>,
}

#[async_trait]
impl SourceSession for RcvSession {
    async fn on_message(&self, msg: ReceivedMessage) {
        self.conn.on_message(msg).await;
    }

    async fn on_source_detached(&self) {
        self.conn.on_source_detached().await;
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::config::CtConfig;
    use crate::context::CtContext;
    use crate::controller::command::CommandEnvelope;
    use crate::controller::controller::ControllerHandle;
    use crate::handshake::conn_end::UimAddr;
    use crate::peer_info::ConnStatus;
    use crate::test_util::{ListenerEvent, RecordingListener};
    use crate::transport::MockTransport;

    use super::*;

    const CT_ID: u32 = 101;
    const CONN_ID: u32 = 3;

    fn local_addr() -> UimAddr {
        UimAddr::new(None, Ipv4Addr::new(10, 0, 0, 1), 14000)
    }

    fn src_end(conn_id: u32) -> ConnEnd {
        ConnEnd::new(202, UimAddr::new(None, Ipv4Addr::new(10, 0, 0, 2), 14001), conn_id)
    }

    fn rcv_end(conn_id: u32) -> ConnEnd {
        ConnEnd::new(CT_ID, local_addr(), conn_id)
    }

    async fn setup(pre_delivery: bool, state: ConnState) -> (Arc<RcvConn>, Arc<RecordingListener>, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let mut transport = MockTransport::new();
        transport.expect_local_addr()
            .return_const(local_addr());
        let (handle, commands) = ControllerHandle::new();
        let config = CtConfig {
            pre_delivery,
            ..CtConfig::new()
        };
        let ctx = Arc::new(CtContext::new(config, CT_ID, Arc::new(transport), handle));

        let listener = RecordingListener::new();
        let shared = Arc::new(RcvShared {
            receiver_id: 1,
            topic: "abc".to_string(),
            metadata: Bytes::from_static(b"rcv-meta"),
            listener: listener.clone(),
            ctx,
        });
        let conn = Arc::new(RcvConn::new(shared, "src-1"));
        {
            let mut inner = conn.inner.lock().await;
            if state != ConnState::PreCreated {
                inner.conn_id = Some(CONN_ID);
            }
            inner.state = state;
        }
        (conn, listener, commands)
    }

    fn data(sequence_number: u32) -> ReceivedMessage {
        ReceivedMessage {
            kind: ReceivedKind::Data,
            topic: "abc".to_string(),
            source_name: "src-1".to_string(),
            sequence_number,
            data: Bytes::from_static(b"payload"),
            is_handshake: false,
        }
    }

    fn handshake(sequence_number: u32, msg: HandshakeMessage) -> ReceivedMessage {
        ReceivedMessage {
            data: msg.to_bytes(),
            is_handshake: true,
            ..data(sequence_number)
        }
    }

    fn crsp(rcv: ConnEnd, src: ConnEnd) -> HandshakeMessage {
        HandshakeMessage::ConnectResponse(ConnectResponseData { rcv, src, metadata: Bytes::from_static(b"src-meta") })
    }

    fn drsp(rcv: ConnEnd, src: ConnEnd) -> HandshakeMessage {
        HandshakeMessage::DisconnectResponse(DisconnectData { rcv, src })
    }

    fn submitted(commands: &mut mpsc::UnboundedReceiver<CommandEnvelope>) -> Vec<&'static str> {
        let mut result = Vec::new();
        while let Ok(envelope) = commands.try_recv() {
            result.push(envelope.command.name());
        }
        result
    }

    #[tokio::test]
    async fn test_data_gating() {
        for (state, pre_delivery, expected) in [
            (ConnState::PreCreated, true, false),
            (ConnState::Starting, false, false),
            (ConnState::Starting, true, true),
            (ConnState::Running, false, true),
            (ConnState::Ending, false, true),
            (ConnState::TimeWait, false, false),
        ] {
            let (conn, listener, _commands) = setup(pre_delivery, state).await;
            conn.on_message(data(5)).await;
            assert_eq!(listener.data_messages().len(), expected as usize, "{:?} {}", state, pre_delivery);
        }
    }

    #[tokio::test]
    async fn test_stream_markers_are_not_delivered() {
        let (conn, listener, _commands) = setup(false, ConnState::Running).await;
        conn.on_message(ReceivedMessage { kind: ReceivedKind::BeginningOfStream, ..data(0) }).await;
        conn.on_message(ReceivedMessage { kind: ReceivedKind::EndOfStream, ..data(9) }).await;
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_own_connect_response() {
        let (conn, listener, mut commands) = setup(false, ConnState::Starting).await;

        conn.on_message(handshake(4, crsp(rcv_end(CONN_ID), src_end(9)))).await;
        {
            let inner = conn.inner.lock().await;
            assert_eq!(inner.state, ConnState::Running);
            assert_eq!(inner.src, Some(src_end(9)));
            assert_eq!(inner.peer_info.rcv_start_seq_num, Some(4));
        }

        let events = listener.events();
        assert_eq!(events.len(), 2);
        let ListenerEvent::Connect(peer) = &events[0] else { panic!("expected connect") };
        assert_eq!(peer.src_metadata, Some(Bytes::from_static(b"src-meta")));
        assert_eq!(peer.rcv_metadata, None);
        // the response itself is delivered after the connect callback, with the new client data
        let ListenerEvent::Message(msg, client_data) = &events[1] else { panic!("expected message") };
        assert!(msg.is_handshake);
        assert_eq!(msg.sequence_number, 4);
        assert_eq!(*client_data, Some(1));
        assert_eq!(submitted(&mut commands), vec!["RcvSendConnectOk"]);

        // a repeated response is answered again, but not reported again
        conn.on_message(handshake(6, crsp(rcv_end(CONN_ID), src_end(9)))).await;
        assert_eq!(listener.connects().len(), 1);
        assert_eq!(submitted(&mut commands), vec!["RcvSendConnectOk"]);
    }

    #[tokio::test]
    async fn test_foreign_connect_response() {
        let (conn, listener, mut commands) = setup(false, ConnState::Starting).await;

        conn.on_message(handshake(4, crsp(rcv_end(CONN_ID + 1), src_end(9)))).await;
        assert_eq!(conn.inner.lock().await.state, ConnState::Starting);
        assert!(listener.events().is_empty());
        assert!(submitted(&mut commands).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_response() {
        let (conn, listener, mut commands) = setup(false, ConnState::Starting).await;
        conn.on_message(handshake(4, crsp(rcv_end(CONN_ID), src_end(9)))).await;
        submitted(&mut commands);

        // names a different source end
        conn.on_message(handshake(7, drsp(rcv_end(CONN_ID), src_end(10)))).await;
        assert_eq!(conn.inner.lock().await.state, ConnState::Running);
        assert!(submitted(&mut commands).is_empty());

        conn.on_message(handshake(8, drsp(rcv_end(CONN_ID), src_end(9)))).await;
        conn.on_message(handshake(9, drsp(rcv_end(CONN_ID), src_end(9)))).await;
        {
            let inner = conn.inner.lock().await;
            assert_eq!(inner.state, ConnState::TimeWait);
            assert_eq!(inner.peer_info.rcv_end_seq_num, Some(8));
        }
        assert_eq!(submitted(&mut commands), vec!["RcvSendDisconnectOk", "RcvSendDisconnectOk"]);

        let disconnects = listener.disconnects();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].status, ConnStatus::Ok);
        assert_eq!(disconnects[0].rcv_end_seq_num, Some(8));

        // the first disconnect response is delivered before the disconnect callback, nothing after it
        let events = listener.events();
        let ListenerEvent::Message(msg, Some(1)) = &events[events.len() - 2] else { panic!("expected message") };
        assert_eq!(msg.sequence_number, 8);
        assert!(matches!(events[events.len() - 1], ListenerEvent::Disconnect(_, Some(1))));
    }

    #[tokio::test]
    async fn test_disconnect_response_before_connect() {
        let (conn, listener, mut commands) = setup(false, ConnState::Starting).await;

        conn.on_message(handshake(8, drsp(rcv_end(CONN_ID), src_end(9)))).await;
        let inner = conn.inner.lock().await;
        assert_eq!(inner.state, ConnState::TimeWait);
        assert_eq!(inner.src, Some(src_end(9)));
        // never connected, so no callbacks
        assert!(listener.events().is_empty());
        assert_eq!(submitted(&mut commands), vec!["RcvSendDisconnectOk"]);
    }

    #[tokio::test]
    async fn test_detach_submits_delete() {
        let (conn, _listener, mut commands) = setup(false, ConnState::Running).await;
        RcvSession { conn: conn.clone() }.on_source_detached().await;
        assert_eq!(submitted(&mut commands), vec!["RcvConnDelete"]);
    }
}
