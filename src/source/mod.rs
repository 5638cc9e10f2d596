//! The source side of connections. A connection is created when a connect request arrives for one
//!  of this process's connected sources, and it is deleted once the disconnect handshake completes
//!  or is given up on. All of this runs on the controller.

pub mod ct_source;
pub mod src_conn;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::context::CtContext;
use crate::controller::command::{SourceCreateData, SourceId};
use crate::handshake::conn_end::ConnEnd;
use crate::handshake::handshake_messages::{check_metadata, check_topic, ConnectOkData, ConnectRequestData, DisconnectData, DisconnectOkData, HandshakeMessage};
use crate::handshake::HANDSHAKE_TOPIC;
use crate::peer_info::{ConnState, ConnStatus};
use crate::source::ct_source::CtSource;
use crate::source::src_conn::SrcConn;
use crate::transport::TopicSource;

pub struct SourceSide {
    ctx: Arc<CtContext>,
    next_source_id: SourceId,
    sources: FxHashMap<SourceId, CtSource>,
    /// only sources that are not exiting, i.e. that accept new connections
    topics: BTreeMap<String, SourceId>,
    /// keyed by the receiver's half of the connection
    conns: BTreeMap<ConnEnd, SrcConn>,
}

impl SourceSide {
    pub fn new(ctx: Arc<CtContext>) -> SourceSide {
        SourceSide {
            ctx,
            next_source_id: 0,
            sources: Default::default(),
            topics: Default::default(),
            conns: Default::default(),
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub async fn create_source(&mut self, data: SourceCreateData) -> anyhow::Result<(SourceId, Arc<dyn TopicSource>)> {
        check_topic(&data.topic)?;
        check_metadata(&data.metadata)?;
        if data.topic == HANDSHAKE_TOPIC {
            bail!("topic {:?} is reserved for handshakes", data.topic);
        }
        if self.topics.contains_key(&data.topic) {
            bail!("there is already a connected source for topic {:?}", data.topic);
        }

        let transport_source = self.ctx.transport.create_source(&data.topic).await?;

        self.next_source_id += 1;
        let id = self.next_source_id;
        info!("created connected source {} for topic {:?} as {}", id, data.topic, transport_source.source_name());

        self.topics.insert(data.topic.clone(), id);
        self.sources.insert(id, CtSource {
            id,
            topic: data.topic,
            metadata: data.metadata,
            listener: data.listener,
            transport_source: transport_source.clone(),
            conns: BTreeSet::new(),
            exiting: false,
        });
        Ok((id, transport_source))
    }

    /// Starts the disconnect handshake for all of the source's connections. The source itself
    ///  is removed when the last of them is gone.
    pub async fn delete_source(&mut self, id: SourceId) -> anyhow::Result<()> {
        let Some(source) = self.sources.get_mut(&id) else {
            bail!("no connected source with id {}", id);
        };
        if source.exiting {
            bail!("connected source {} is already being deleted", id);
        }

        info!("deleting connected source {} for topic {:?} with {} connections", id, source.topic, source.conns.len());
        source.exiting = true;
        self.topics.remove(&source.topic);

        for key in &source.conns {
            let Some(conn) = self.conns.get_mut(key) else {
                continue;
            };
            if conn.state == ConnState::Ending {
                continue;
            }

            conn.set_state(&self.ctx, ConnState::Ending);
            conn.cancel_timer().await;
            conn.try_cnt = 1;
            if let Err(e) = conn.send_disconnect_response(&self.ctx, &source.transport_source).await {
                warn!("error sending disconnect response to {:?}: {}", key, e);
            }
            conn.schedule_tick(&self.ctx, self.ctx.config.retry_ivl)?;
        }

        if source.conns.is_empty() {
            self.finish_source(id).await?;
        }
        Ok(())
    }

    async fn finish_source(&mut self, id: SourceId) -> anyhow::Result<()> {
        let Some(source) = self.sources.remove(&id) else {
            return Ok(());
        };
        debug!("connected source {} for topic {:?} has no connections left - releasing it", id, source.topic);
        source.transport_source.delete().await
    }

    pub async fn on_handshake(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let msg = match HandshakeMessage::deser(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed handshake message: {}", e);
                return Ok(());
            }
        };
        trace!("received {:?}", msg);

        match msg {
            HandshakeMessage::ConnectRequest(data) => self.on_connect_request(data).await,
            HandshakeMessage::ConnectOk(data) => self.on_connect_ok(data).await,
            HandshakeMessage::DisconnectRequest(data) => self.on_disconnect_request(data).await,
            HandshakeMessage::DisconnectOk(data) => self.on_disconnect_ok(data).await,
            other => {
                warn!("{} is not addressed to a source - dropping", other.tag());
                Ok(())
            }
        }
    }

    async fn on_connect_request(&mut self, data: ConnectRequestData) -> anyhow::Result<()> {
        let key = data.rcv;

        if !self.conns.contains_key(&key) {
            let Some(source_id) = self.topics.get(&data.topic).copied() else {
                bail!("connect request from {:?} for topic {:?} which has no connected source", key, data.topic);
            };
            let source = self.sources.get_mut(&source_id)
                .ok_or_else(|| anyhow!("topic {:?} refers to a missing source {}", data.topic, source_id))?;

            let conn = SrcConn::new(source_id, key, self.ctx.conn_end(self.ctx.next_conn_id()), source.metadata.clone());
            debug!("new connection {:?} from receiver {:?} for topic {:?}", conn.src, key, data.topic);
            source.conns.insert(key);
            self.conns.insert(key, conn);
        }

        let conn = self.conns.get_mut(&key)
            .ok_or_else(|| anyhow!("connection {:?} disappeared", key))?;
        let source = self.sources.get(&conn.source_id)
            .ok_or_else(|| anyhow!("connection {:?} refers to a missing source {}", key, conn.source_id))?;
        if source.exiting {
            bail!("connect request from {:?} for source {} which is being deleted", key, source.id);
        }

        match conn.state {
            ConnState::Starting => {
                conn.cancel_timer().await;
                conn.try_cnt = 1;
                if let Err(e) = conn.send_connect_response(&self.ctx, &source.transport_source).await {
                    warn!("error sending connect response to {:?}: {}", key, e);
                }
                conn.schedule_tick(&self.ctx, self.ctx.config.retry_ivl)?;
            }
            ConnState::Running => {
                // the receiver saw a connect response before, so this is a late duplicate
                debug!("connect request for running connection {:?} - ignoring", key);
            }
            other => {
                warn!("connect request for connection {:?} in state {:?} - ignoring", key, other);
            }
        }
        Ok(())
    }

    /// Finds the connection a reply refers to. The reply must name this process's half of the
    ///  connection as well, otherwise it belongs to some other (probably earlier) connection.
    fn conn_for_reply(&mut self, tag: &str, rcv: &ConnEnd, src: &ConnEnd) -> Option<&mut SrcConn> {
        let Some(conn) = self.conns.get_mut(rcv) else {
            debug!("{} for unknown connection {:?} - dropping", tag, rcv);
            return None;
        };
        if conn.src != *src {
            warn!("{} for connection {:?} names source end {:?} rather than {:?} - dropping", tag, rcv, src, conn.src);
            return None;
        }
        Some(conn)
    }

    async fn on_connect_ok(&mut self, data: ConnectOkData) -> anyhow::Result<()> {
        let Some(conn) = self.conn_for_reply("C_OK", &data.rcv, &data.src) else {
            return Ok(());
        };

        match conn.state {
            ConnState::Starting => {
                conn.peer_info.rcv_start_seq_num = Some(data.start_seq_num);
                conn.peer_info.rcv_metadata = Some(data.metadata);
                let source_id = conn.source_id;

                let conn = self.conns.get_mut(&data.rcv)
                    .ok_or_else(|| anyhow!("connection {:?} disappeared", data.rcv))?;
                let source = self.sources.get(&source_id)
                    .ok_or_else(|| anyhow!("connection {:?} refers to a missing source {}", data.rcv, source_id))?;

                conn.set_state(&self.ctx, ConnState::Running);
                conn.cancel_timer().await;
                info!("connection {:?} on topic {:?} is established", data.rcv, source.topic);
                conn.notify_connect(&source.listener);
            }
            ConnState::Running => debug!("duplicate connect ok for {:?}", data.rcv),
            other => debug!("connect ok for connection {:?} in state {:?} - ignoring", data.rcv, other),
        }
        Ok(())
    }

    async fn on_disconnect_request(&mut self, data: DisconnectData) -> anyhow::Result<()> {
        if self.conn_for_reply("DREQ", &data.rcv, &data.src).is_none() {
            return Ok(());
        }
        let conn = self.conns.get_mut(&data.rcv)
            .ok_or_else(|| anyhow!("connection {:?} disappeared", data.rcv))?;
        let source = self.sources.get(&conn.source_id)
            .ok_or_else(|| anyhow!("connection {:?} refers to a missing source {}", data.rcv, conn.source_id))?;

        match conn.state {
            ConnState::Starting | ConnState::Running | ConnState::Ending => {
                conn.cancel_timer().await;
                conn.set_state(&self.ctx, ConnState::Ending);
                conn.try_cnt = 1;
                if let Err(e) = conn.send_disconnect_response(&self.ctx, &source.transport_source).await {
                    warn!("error sending disconnect response to {:?}: {}", data.rcv, e);
                }
                conn.schedule_tick(&self.ctx, self.ctx.config.retry_ivl)?;
                conn.notify_disconnect(&source.listener);
            }
            other => debug!("disconnect request for connection {:?} in state {:?} - ignoring", data.rcv, other),
        }
        Ok(())
    }

    async fn on_disconnect_ok(&mut self, data: DisconnectOkData) -> anyhow::Result<()> {
        let Some(conn) = self.conn_for_reply("D_OK", &data.rcv, &data.src) else {
            return Ok(());
        };

        conn.peer_info.rcv_end_seq_num = Some(data.end_seq_num);
        if conn.state != ConnState::Ending {
            warn!("disconnect ok for connection {:?} in state {:?}", data.rcv, conn.state);
        }
        self.conn_delete(data.rcv).await
    }

    pub async fn on_tick(&mut self, key: ConnEnd, tmr_id: u32) -> anyhow::Result<()> {
        let Some(conn) = self.conns.get_mut(&key) else {
            trace!("tick {} for deleted connection {:?} - ignoring", tmr_id, key);
            return Ok(());
        };
        if conn.pending_tmr_id != Some(tmr_id) {
            trace!("stale tick {} for connection {:?} - ignoring", tmr_id, key);
            return Ok(());
        }
        conn.pending_tmr_id = None;

        let source = self.sources.get(&conn.source_id)
            .ok_or_else(|| anyhow!("connection {:?} refers to a missing source {}", key, conn.source_id))?;
        let max_tries = self.ctx.config.max_tries;

        let state = conn.state;
        match state {
            ConnState::Starting if conn.try_cnt < max_tries => {
                conn.try_cnt += 1;
                debug!("resending connect response to {:?} (try #{})", key, conn.try_cnt);
                if let Err(e) = conn.send_connect_response(&self.ctx, &source.transport_source).await {
                    warn!("error sending connect response to {:?}: {}", key, e);
                }
                conn.schedule_tick(&self.ctx, self.ctx.config.retry_ivl)?;
            }
            ConnState::Starting => {
                warn!("giving up connecting to receiver {:?} for topic {:?} after {} tries", key, source.topic, conn.try_cnt);
                conn.peer_info.status = ConnStatus::BadClose;
                self.conn_delete(key).await?;
            }
            ConnState::Ending if conn.try_cnt < max_tries => {
                conn.try_cnt += 1;
                debug!("resending disconnect response to {:?} (try #{})", key, conn.try_cnt);
                if let Err(e) = conn.send_disconnect_response(&self.ctx, &source.transport_source).await {
                    warn!("error sending disconnect response to {:?}: {}", key, e);
                }
                conn.schedule_tick(&self.ctx, self.ctx.config.retry_ivl)?;
            }
            ConnState::Ending => {
                warn!("giving up disconnecting from receiver {:?} for topic {:?} after {} tries", key, source.topic, conn.try_cnt);
                conn.peer_info.status = ConnStatus::BadClose;
                self.conn_delete(key).await?;
            }
            other => info!("tick for connection {:?} in state {:?} - ignoring", key, other),
        }
        Ok(())
    }

    async fn conn_delete(&mut self, key: ConnEnd) -> anyhow::Result<()> {
        let Some(mut conn) = self.conns.remove(&key) else {
            return Ok(());
        };
        conn.cancel_timer().await;
        debug!("deleting connection {:?} with status {:?}", key, conn.peer_info.status);
        self.ctx.record_event(|| format!("src conn {:?} deleted", key));

        let source_id = conn.source_id;
        let Some(source) = self.sources.get_mut(&source_id) else {
            bail!("connection {:?} refers to a missing source {}", key, source_id);
        };
        conn.notify_disconnect(&source.listener);
        source.conns.remove(&key);

        if source.exiting && source.conns.is_empty() {
            self.finish_source(source_id).await?;
        }
        Ok(())
    }
}
