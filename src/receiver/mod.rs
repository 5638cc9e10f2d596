//! The receiving side of connections. The transport attaches sources to a connected receiver,
//!  and each attached source gets a connection that runs the connect handshake. Connections are
//!  freed when the transport detaches their source, which may be long after the disconnect
//!  handshake completed.

pub mod ct_receiver;
pub mod rcv_conn;

use std::sync::{Arc, Weak};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::context::CtContext;
use crate::controller::command::{ReceiverCreateData, ReceiverId};
use crate::handshake::handshake_messages::{check_metadata, check_topic};
use crate::handshake::HANDSHAKE_TOPIC;
use crate::peer_info::{ConnState, ConnStatus};
use crate::receiver::ct_receiver::{CtReceiver, RcvNotifyHandler, RcvShared};
use crate::receiver::rcv_conn::RcvConn;

pub struct ReceiverSide {
    ctx: Arc<CtContext>,
    next_receiver_id: ReceiverId,
    receivers: FxHashMap<ReceiverId, CtReceiver>,
}

impl ReceiverSide {
    pub fn new(ctx: Arc<CtContext>) -> ReceiverSide {
        ReceiverSide {
            ctx,
            next_receiver_id: 0,
            receivers: Default::default(),
        }
    }

    pub fn num_receivers(&self) -> usize {
        self.receivers.len()
    }

    pub async fn create_receiver(&mut self, data: ReceiverCreateData) -> anyhow::Result<ReceiverId> {
        check_topic(&data.topic)?;
        check_metadata(&data.metadata)?;
        if data.topic == HANDSHAKE_TOPIC {
            bail!("topic {:?} is reserved for handshakes", data.topic);
        }

        self.next_receiver_id += 1;
        let id = self.next_receiver_id;

        let shared = Arc::new(RcvShared {
            receiver_id: id,
            topic: data.topic,
            metadata: data.metadata,
            listener: data.listener,
            ctx: self.ctx.clone(),
        });
        let transport_receiver = self.ctx.transport.create_receiver(&shared.topic, Arc::new(RcvNotifyHandler { shared: shared.clone() })).await?;
        info!("created connected receiver {} for topic {:?}", id, shared.topic);

        self.receivers.insert(id, CtReceiver {
            shared,
            transport_receiver: Some(transport_receiver),
            conns: Vec::new(),
            exiting: false,
        });
        Ok(id)
    }

    /// Starts the disconnect handshake for running connections. The receiver is removed once
    ///  the transport detached all of its sources.
    pub async fn delete_receiver(&mut self, id: ReceiverId) -> anyhow::Result<()> {
        let Some(receiver) = self.receivers.get_mut(&id) else {
            bail!("no connected receiver with id {}", id);
        };
        if receiver.exiting {
            bail!("connected receiver {} is already being deleted", id);
        }

        info!("deleting connected receiver {} for topic {:?} with {} connections", id, receiver.shared.topic, receiver.conns.len());
        receiver.exiting = true;

        for conn in &receiver.conns {
            let mut inner = conn.inner.lock().await;
            let state = inner.state;
            match state {
                ConnState::Running => {
                    conn.set_state(&mut inner, ConnState::Ending);
                    inner.cancel_timer().await;
                    inner.try_cnt = 1;
                    if let Err(e) = conn.send_disconnect_request(&inner).await {
                        warn!("error sending disconnect request to {}: {}", conn.source_name(), e);
                    }
                    conn.schedule_tick(&mut inner, self.ctx.config.retry_ivl)?;
                }
                ConnState::Starting => {
                    // Skips Ending: the source end is not known before a connect response, so
                    //  a disconnect request could not be addressed and would only be retried
                    //  until the tries run out.
                    inner.cancel_timer().await;
                    conn.set_state(&mut inner, ConnState::TimeWait);
                }
                other => debug!("connection to {} is {:?} - nothing to do", conn.source_name(), other),
            }
        }

        self.maybe_finish_receiver(id).await
    }

    /// An exiting receiver is torn down once its connections are gone. While it still has
    ///  connections that are all done with their handshakes, its transport receiver is deleted
    ///  so the transport detaches the remaining sources.
    async fn maybe_finish_receiver(&mut self, id: ReceiverId) -> anyhow::Result<()> {
        let Some(receiver) = self.receivers.get_mut(&id) else {
            return Ok(());
        };
        if !receiver.exiting {
            return Ok(());
        }

        if receiver.conns.is_empty() {
            info!("connected receiver {} for topic {:?} is deleted", id, receiver.shared.topic);
            let transport_receiver = receiver.transport_receiver.take();
            self.receivers.remove(&id);
            if let Some(transport_receiver) = transport_receiver {
                transport_receiver.delete().await?;
            }
            return Ok(());
        }

        if receiver.transport_receiver.is_none() {
            return Ok(());
        }
        for conn in &receiver.conns {
            if conn.inner.lock().await.state != ConnState::TimeWait {
                return Ok(());
            }
        }
        if let Some(transport_receiver) = receiver.transport_receiver.take() {
            debug!("all connections of receiver {} are closed - detaching their sources", id);
            transport_receiver.delete().await?;
        }
        Ok(())
    }

    pub async fn conn_create(&mut self, conn: Arc<RcvConn>) -> anyhow::Result<()> {
        let receiver_id = conn.shared.receiver_id;
        let Some(receiver) = self.receivers.get_mut(&receiver_id).filter(|r| !r.exiting) else {
            debug!("source {} attached to receiver {} which is gone or being deleted - not connecting", conn.source_name(), receiver_id);
            return Ok(());
        };

        {
            let mut inner = conn.inner.lock().await;
            inner.conn_id = Some(self.ctx.next_conn_id());
            conn.set_state(&mut inner, ConnState::Starting);
            inner.peer_info.rcv_metadata = Some(receiver.shared.metadata.clone());
            inner.peer_info.rcv_source_name = Some(conn.source_name().to_string());
            inner.curr_creq_timeout = self.ctx.config.delay_creq;
            conn.schedule_tick(&mut inner, self.ctx.config.delay_creq)?;
        }
        debug!("new connection to source {} for receiver {}", conn.source_name(), receiver_id);
        receiver.conns.push(conn);
        Ok(())
    }

    pub async fn conn_delete(&mut self, conn: Arc<RcvConn>) -> anyhow::Result<()> {
        {
            let mut inner = conn.inner.lock().await;
            debug!("source {} detached in state {:?}", conn.source_name(), inner.state);
            if inner.state != ConnState::TimeWait {
                inner.peer_info.status = ConnStatus::BadClose;
            }
            inner.notify_disconnect(&conn.shared.listener);
            inner.cancel_timer().await;
        }

        let receiver_id = conn.shared.receiver_id;
        if let Some(receiver) = self.receivers.get_mut(&receiver_id) {
            receiver.conns.retain(|c| !Arc::ptr_eq(c, &conn));
        }
        self.ctx.record_event(|| format!("rcv conn {} deleted", conn.source_name()));
        self.maybe_finish_receiver(receiver_id).await
    }

    pub async fn on_tick(&mut self, conn: Weak<RcvConn>, tmr_id: u32) -> anyhow::Result<()> {
        let Some(conn) = conn.upgrade() else {
            trace!("tick {} for a deleted connection - ignoring", tmr_id);
            return Ok(());
        };

        {
            let mut inner = conn.inner.lock().await;
            if inner.pending_tmr_id != Some(tmr_id) {
                trace!("stale tick {} for connection to {} - ignoring", tmr_id, conn.source_name());
                return Ok(());
            }
            inner.pending_tmr_id = None;

            let config = &self.ctx.config;
            let state = inner.state;
            match state {
                ConnState::Starting => {
                    if inner.curr_creq_timeout < config.retry_ivl {
                        let next = if inner.curr_creq_timeout.is_zero() {
                            config.retry_ivl / 10
                        }
                        else {
                            inner.curr_creq_timeout * 10
                        };
                        inner.curr_creq_timeout = next.min(config.retry_ivl);
                    }

                    if inner.try_cnt < config.max_tries {
                        inner.try_cnt += 1;
                        debug!("sending connect request to {} (try #{})", conn.source_name(), inner.try_cnt);
                        match conn.send_connect_request(&inner).await {
                            Ok(()) => {
                                let delay = inner.curr_creq_timeout;
                                conn.schedule_tick(&mut inner, delay)?;
                            }
                            Err(e) => {
                                warn!("cannot send connect request to source {} for topic {:?}: {}", conn.source_name(), conn.shared.topic, e);
                                inner.peer_info.status = ConnStatus::BadClose;
                                conn.set_state(&mut inner, ConnState::TimeWait);
                            }
                        }
                    }
                    else {
                        warn!("giving up connecting to source {} for topic {:?} after {} tries", conn.source_name(), conn.shared.topic, inner.try_cnt);
                        inner.peer_info.status = ConnStatus::BadClose;
                        conn.set_state(&mut inner, ConnState::TimeWait);
                    }
                }
                ConnState::Ending => {
                    if inner.try_cnt < config.max_tries {
                        inner.try_cnt += 1;
                        debug!("resending disconnect request to {} (try #{})", conn.source_name(), inner.try_cnt);
                        if let Err(e) = conn.send_disconnect_request(&inner).await {
                            warn!("error sending disconnect request to {}: {}", conn.source_name(), e);
                        }
                        conn.schedule_tick(&mut inner, config.retry_ivl)?;
                    }
                    else {
                        warn!("giving up disconnecting from source {} for topic {:?} after {} tries", conn.source_name(), conn.shared.topic, inner.try_cnt);
                        inner.peer_info.status = ConnStatus::BadClose;
                        conn.set_state(&mut inner, ConnState::TimeWait);
                        inner.notify_disconnect(&conn.shared.listener);
                    }
                }
                other => info!("tick for connection to {} in state {:?} - ignoring", conn.source_name(), other),
            }
        }

        self.maybe_finish_receiver(conn.shared.receiver_id).await
    }

    pub async fn send_connect_ok(&mut self, conn: Weak<RcvConn>) -> anyhow::Result<()> {
        let Some(conn) = conn.upgrade() else {
            return Ok(());
        };
        let inner = conn.inner.lock().await;
        if inner.state != ConnState::Running {
            debug!("connection to {} is {:?} - not sending connect ok", conn.source_name(), inner.state);
            return Ok(());
        }
        conn.send_connect_ok(&inner).await
    }

    pub async fn send_disconnect_ok(&mut self, conn: Weak<RcvConn>) -> anyhow::Result<()> {
        let Some(conn) = conn.upgrade() else {
            return Ok(());
        };
        {
            let inner = conn.inner.lock().await;
            if inner.state == ConnState::TimeWait {
                conn.send_disconnect_ok(&inner).await?;
            }
            else {
                debug!("connection to {} is {:?} - not sending disconnect ok", conn.source_name(), inner.state);
            }
        }
        self.maybe_finish_receiver(conn.shared.receiver_id).await
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::time::{timeout_at, Instant};

    use crate::config::CtConfig;
    use crate::controller::command::{Command, CommandEnvelope};
    use crate::controller::controller::ControllerHandle;
    use crate::handshake::conn_end::UimAddr;
    use crate::test_util::RecordingListener;
    use crate::transport::loopback::LoopbackBus;
    use crate::transport::{MockTopicReceiver, MockTransport, TopicReceiver, Transport};

    use super::*;

    struct Setup {
        side: ReceiverSide,
        commands: mpsc::UnboundedReceiver<CommandEnvelope>,
        bus: LoopbackBus,
        listener: Arc<RecordingListener>,
    }

    impl Setup {
        async fn new() -> Setup {
            let bus = LoopbackBus::new();
            let transport = bus.new_transport(None).await;
            Setup::with_transport(bus, transport)
        }

        fn with_transport(bus: LoopbackBus, transport: Arc<dyn Transport>) -> Setup {
            let (handle, commands) = ControllerHandle::new();
            let config = CtConfig {
                delay_creq: Duration::from_millis(10),
                retry_ivl: Duration::from_millis(1000),
                max_tries: 3,
                ..CtConfig::new()
            };
            let ctx = Arc::new(CtContext::new(config, 101, transport, handle));

            Setup {
                side: ReceiverSide::new(ctx),
                commands,
                bus,
                listener: RecordingListener::new(),
            }
        }

        async fn create_receiver(&mut self) -> ReceiverId {
            self.side.create_receiver(ReceiverCreateData {
                topic: "abc".to_string(),
                metadata: Bytes::from_static(b"rcv-meta"),
                listener: self.listener.clone(),
            }).await.unwrap()
        }

        /// executes a receiver side command as the controller would
        async fn execute(&mut self, command: Command) {
            match command {
                Command::RcvConnCreate(conn) => self.side.conn_create(conn).await.unwrap(),
                Command::RcvConnDelete(conn) => self.side.conn_delete(conn).await.unwrap(),
                Command::RcvConnTick { conn, tmr_id } => self.side.on_tick(conn, tmr_id).await.unwrap(),
                Command::RcvSendConnectOk(conn) => self.side.send_connect_ok(conn).await.unwrap(),
                Command::RcvSendDisconnectOk(conn) => self.side.send_disconnect_ok(conn).await.unwrap(),
                other => panic!("unexpected command {:?}", other),
            }
        }

        async fn pump_for(&mut self, duration: Duration) {
            let deadline = Instant::now() + duration;
            while let Ok(Some(envelope)) = timeout_at(deadline, self.commands.recv()).await {
                self.execute(envelope.command).await;
            }
        }

        /// executes commands until a timer submits a tick, and returns that tick without executing it
        async fn next_tick(&mut self) -> (Weak<RcvConn>, u32) {
            loop {
                let envelope = self.commands.recv().await.unwrap();
                match envelope.command {
                    Command::RcvConnTick { conn, tmr_id } => return (conn, tmr_id),
                    other => self.execute(other).await,
                }
            }
        }

        async fn conn_states(&self, id: ReceiverId) -> Vec<(ConnState, ConnStatus)> {
            let mut result = Vec::new();
            for conn in &self.side.receivers[&id].conns {
                let inner = conn.inner.lock().await;
                result.push((inner.state, inner.peer_info.status));
            }
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_request_backoff_and_give_up() {
        let mut setup = Setup::new().await;

        // a source without a connected topics instance behind it never answers
        let source_transport = setup.bus.new_transport(None).await;
        let _source = source_transport.create_source("abc").await.unwrap();

        let id = setup.create_receiver().await;
        let started = Instant::now();
        setup.pump_for(Duration::from_secs(10)).await;

        let creqs = setup.bus.tapped_with_tag("CREQ").await;
        assert_eq!(creqs.len(), 3);
        let offsets = creqs.iter()
            .map(|m| (m.at - started).as_millis())
            .collect::<Vec<_>>();
        assert!((10..15).contains(&offsets[0]), "{:?}", offsets);
        assert!((110..120).contains(&offsets[1]), "{:?}", offsets);
        assert!((1110..1125).contains(&offsets[2]), "{:?}", offsets);

        assert_eq!(setup.conn_states(id).await, vec![(ConnState::TimeWait, ConnStatus::BadClose)]);
        assert!(setup.listener.events().is_empty());

        // the connection is done, so deleting the receiver detaches the source right away
        setup.side.delete_receiver(id).await.unwrap();
        setup.pump_for(Duration::from_millis(100)).await;
        assert_eq!(setup.side.num_receivers(), 0);
        assert_eq!(setup.bus.num_receivers().await, 0);
        assert!(setup.listener.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_tick_is_ignored() {
        let mut setup = Setup::new().await;
        let source_transport = setup.bus.new_transport(None).await;
        let _source = source_transport.create_source("abc").await.unwrap();

        let id = setup.create_receiver().await;
        let (conn, tmr_id) = setup.next_tick().await;
        setup.side.on_tick(conn.clone(), tmr_id).await.unwrap();
        assert_eq!(setup.bus.tapped_with_tag("CREQ").await.len(), 1);

        setup.side.on_tick(conn.clone(), tmr_id).await.unwrap();
        setup.side.on_tick(conn.clone(), tmr_id.wrapping_add(100)).await.unwrap();
        assert_eq!(setup.bus.tapped_with_tag("CREQ").await.len(), 1);

        let conn = conn.upgrade().unwrap();
        let inner = conn.inner.lock().await;
        assert_eq!(inner.state, ConnState::Starting);
        assert_eq!(inner.try_cnt, 1);
        assert!(inner.pending_tmr_id.is_some());
        assert_ne!(inner.pending_tmr_id, Some(tmr_id));
        drop(inner);
        assert_eq!(setup.conn_states(id).await, vec![(ConnState::Starting, ConnStatus::Ok)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_request_send_error() {
        let mut transport = MockTransport::new();
        transport.expect_local_addr()
            .return_const(UimAddr::new(None, Ipv4Addr::new(10, 0, 0, 1), 14000));
        transport.expect_create_receiver()
            .returning(|_, _| {
                let mut transport_receiver = MockTopicReceiver::new();
                transport_receiver.expect_delete()
                    .returning(|| Ok(()));
                let transport_receiver: Arc<dyn TopicReceiver> = Arc::new(transport_receiver);
                Ok(transport_receiver)
            });
        transport.expect_send_immediate()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("unknown source")));

        let mut setup = Setup::with_transport(LoopbackBus::new(), Arc::new(transport));
        let id = setup.create_receiver().await;

        // the mock transport never attaches sources, so the connection is created directly
        let shared = setup.side.receivers[&id].shared.clone();
        setup.side.conn_create(Arc::new(RcvConn::new(shared, "LOOPBACK:10.0.0.2:14001:1"))).await.unwrap();
        setup.pump_for(Duration::from_secs(10)).await;

        assert_eq!(setup.conn_states(id).await, vec![(ConnState::TimeWait, ConnStatus::BadClose)]);
        let conn = setup.side.receivers[&id].conns[0].clone();
        assert_eq!(conn.inner.lock().await.pending_tmr_id, None);
        assert!(setup.commands.try_recv().is_err());
        assert!(setup.listener.events().is_empty());

        setup.side.delete_receiver(id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_starting_receiver() {
        let mut setup = Setup::new().await;
        let source_transport = setup.bus.new_transport(None).await;
        let _source = source_transport.create_source("abc").await.unwrap();

        let id = setup.create_receiver().await;
        setup.pump_for(Duration::from_millis(50)).await;
        assert_eq!(setup.conn_states(id).await, vec![(ConnState::Starting, ConnStatus::Ok)]);

        setup.side.delete_receiver(id).await.unwrap();
        assert!(setup.side.delete_receiver(id).await.is_err());
        setup.pump_for(Duration::from_secs(5)).await;

        assert_eq!(setup.side.num_receivers(), 0);
        assert_eq!(setup.bus.tapped_with_tag("CREQ").await.len(), 1);
        assert!(setup.bus.tapped_with_tag("DREQ").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_attached_after_delete_is_not_connected() {
        let mut setup = Setup::new().await;
        let source_transport = setup.bus.new_transport(None).await;
        let _source = source_transport.create_source("abc").await.unwrap();

        let id = setup.create_receiver().await;
        // the attach notification is still queued when the receiver is deleted
        setup.side.delete_receiver(id).await.unwrap();
        setup.pump_for(Duration::from_secs(5)).await;

        assert_eq!(setup.side.num_receivers(), 0);
        assert!(setup.bus.tapped_messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_unknown_receiver() {
        let mut setup = Setup::new().await;
        assert!(setup.side.delete_receiver(42).await.is_err());
    }
}
