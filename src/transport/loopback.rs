use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::handshake::conn_end::UimAddr;
use crate::transport::{Destination, ImmediateHandler, ReceivedKind, ReceivedMessage, SourceNotifyHandler, SourceSession, TopicReceiver, TopicSource, Transport};

const FIRST_PORT: u16 = 14000;

/// A handshake-relevant message as it passed through the bus
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TappedMessage {
    pub at: Instant,
    /// the first four bytes, i.e. the handshake tag for handshake messages
    pub tag: String,
    pub route: TapRoute,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TapRoute {
    DataStream { source_name: String },
    Immediate { to: UimAddr },
}

/// An in-memory publish/subscribe bus. Each [LoopbackTransport] created from it plays the role of a
///  separate process with its own address; sources and receivers on the same topic find each other
///  regardless of which transport created them.
///
/// Every receiver gets its own delivery task, so messages and attach / detach notifications are
///  delivered in order per receiver, and never on the sender's task.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    next_port: u16,
    next_id: u64,
    sources: BTreeMap<String, BusSource>,
    receivers: FxHashMap<u64, BusReceiver>,
    immediate_listeners: FxHashMap<(UimAddr, String), mpsc::UnboundedSender<Bytes>>,
    tap: Vec<TappedMessage>,
}

struct BusSource {
    topic: String,
    owner: UimAddr,
    next_sequence_number: u32,
    attached: FxHashSet<u64>,
}

struct BusReceiver {
    topic: String,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    attached: FxHashSet<String>,
}

enum DeliveryEvent {
    Attach(String),
    Message(ReceivedMessage),
    Detach(String),
}

impl LoopbackBus {
    pub fn new() -> LoopbackBus {
        Default::default()
    }

    pub async fn new_transport(&self, domain_id: Option<u32>) -> Arc<LoopbackTransport> {
        let mut state = self.state.lock().await;
        let port = FIRST_PORT + state.next_port;
        state.next_port += 1;

        Arc::new(LoopbackTransport {
            bus: self.clone(),
            addr: UimAddr::new(domain_id, Ipv4Addr::LOCALHOST, port),
        })
    }

    /// All handshake messages sent so far, in the order they were sent
    pub async fn tapped_messages(&self) -> Vec<TappedMessage> {
        self.state.lock().await.tap.clone()
    }

    pub async fn tapped_with_tag(&self, tag: &str) -> Vec<TappedMessage> {
        self.state.lock().await.tap.iter()
            .filter(|m| m.tag == tag)
            .cloned()
            .collect()
    }

    pub async fn num_sources(&self) -> usize {
        self.state.lock().await.sources.len()
    }

    pub async fn num_receivers(&self) -> usize {
        self.state.lock().await.receivers.len()
    }

    pub async fn num_immediate_listeners(&self) -> usize {
        self.state.lock().await.immediate_listeners.len()
    }
}

impl BusState {
    fn new_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn attach(&mut self, source_name: &str, receiver_id: u64) {
        let (Some(source), Some(receiver)) = (self.sources.get_mut(source_name), self.receivers.get_mut(&receiver_id)) else {
            return;
        };
        trace!("attaching source {} to receiver {}", source_name, receiver_id);
        source.attached.insert(receiver_id);
        receiver.attached.insert(source_name.to_string());

        let _ = receiver.events.send(DeliveryEvent::Attach(source_name.to_string()));
        let _ = receiver.events.send(DeliveryEvent::Message(ReceivedMessage {
            kind: ReceivedKind::BeginningOfStream,
            topic: source.topic.clone(),
            source_name: source_name.to_string(),
            sequence_number: source.next_sequence_number,
            data: Bytes::new(),
            is_handshake: false,
        }));
    }

    fn tap(&mut self, buf: &[u8], route: TapRoute) {
        let tag = String::from_utf8_lossy(&buf[..buf.len().min(4)]).to_string();
        self.tap.push(TappedMessage {
            at: Instant::now(),
            tag,
            route,
        });
    }
}


pub struct LoopbackTransport {
    bus: LoopbackBus,
    addr: UimAddr,
}

impl Debug for LoopbackTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopbackTransport{{addr:{:?}}}", self.addr)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_addr(&self) -> UimAddr {
        self.addr
    }

    async fn create_source(&self, topic: &str) -> anyhow::Result<Arc<dyn TopicSource>> {
        let mut state = self.bus.state.lock().await;
        let id = state.new_id();
        let source_name = format!("LOOPBACK:{}:{}:{}", self.addr.ip, self.addr.port, id);
        debug!("creating source {} for topic {:?}", source_name, topic);

        state.sources.insert(source_name.clone(), BusSource {
            topic: topic.to_string(),
            owner: self.addr,
            next_sequence_number: 0,
            attached: Default::default(),
        });

        let receiver_ids = state.receivers.iter()
            .filter(|(_, r)| r.topic == topic)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for receiver_id in receiver_ids {
            state.attach(&source_name, receiver_id);
        }

        Ok(Arc::new(LoopbackSource {
            bus: self.bus.clone(),
            source_name,
        }))
    }

    async fn create_receiver(&self, topic: &str, handler: Arc<dyn SourceNotifyHandler>) -> anyhow::Result<Arc<dyn TopicReceiver>> {
        let (send, recv) = mpsc::unbounded_channel();

        let mut state = self.bus.state.lock().await;
        let id = state.new_id();
        debug!("creating receiver {} for topic {:?}", id, topic);

        state.receivers.insert(id, BusReceiver {
            topic: topic.to_string(),
            events: send,
            attached: Default::default(),
        });
        tokio::spawn(deliver_loop(handler, recv));

        let source_names = state.sources.iter()
            .filter(|(_, s)| s.topic == topic)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for source_name in source_names {
            state.attach(&source_name, id);
        }

        Ok(Arc::new(LoopbackReceiver {
            bus: self.bus.clone(),
            id,
        }))
    }

    async fn listen_immediate(&self, topic: &str, handler: Arc<dyn ImmediateHandler>) -> anyhow::Result<Arc<dyn TopicReceiver>> {
        let key = (self.addr, topic.to_string());

        let mut state = self.bus.state.lock().await;
        if state.immediate_listeners.contains_key(&key) {
            bail!("{:?} is already listening on topic {:?}", self.addr, topic);
        }

        let (send, mut recv) = mpsc::unbounded_channel::<Bytes>();
        state.immediate_listeners.insert(key.clone(), send);
        tokio::spawn(async move {
            while let Some(buf) = recv.recv().await {
                handler.on_immediate(buf).await;
            }
        });

        Ok(Arc::new(LoopbackImmediateListener {
            bus: self.bus.clone(),
            key,
        }))
    }

    async fn send_immediate(&self, to: &Destination, topic: &str, buf: &[u8]) -> anyhow::Result<()> {
        let mut state = self.bus.state.lock().await;

        let to_addr = match to {
            Destination::Addr(addr) => *addr,
            Destination::Source(source_name) => state.sources.get(source_name)
                .map(|s| s.owner)
                .ok_or_else(|| anyhow!("unknown source {}", source_name))?,
        };

        state.tap(buf, TapRoute::Immediate { to: to_addr });

        match state.immediate_listeners.get(&(to_addr, topic.to_string())) {
            Some(listener) => {
                let _ = listener.send(Bytes::copy_from_slice(buf));
            }
            None => {
                trace!("no listener for topic {:?} at {:?} - dropping message", topic, to_addr);
            }
        }
        Ok(())
    }
}

async fn deliver_loop(handler: Arc<dyn SourceNotifyHandler>, mut events: mpsc::UnboundedReceiver<DeliveryEvent>) {
    let mut sessions: FxHashMap<String, Arc<dyn SourceSession>> = Default::default();

    while let Some(event) = events.recv().await {
        match event {
            DeliveryEvent::Attach(source_name) => {
                let session = handler.on_source_attached(&source_name).await;
                sessions.insert(source_name, session);
            }
            DeliveryEvent::Message(msg) => {
                if let Some(session) = sessions.get(&msg.source_name) {
                    session.on_message(msg).await;
                }
            }
            DeliveryEvent::Detach(source_name) => {
                if let Some(session) = sessions.remove(&source_name) {
                    session.on_source_detached().await;
                }
            }
        }
    }
    trace!("receiver delivery loop terminated");
}


struct LoopbackSource {
    bus: LoopbackBus,
    source_name: String,
}

#[async_trait]
impl TopicSource for LoopbackSource {
    fn source_name(&self) -> String {
        self.source_name.clone()
    }

    async fn send(&self, buf: &[u8], is_handshake: bool) -> anyhow::Result<()> {
        let mut state = self.bus.state.lock().await;
        let state = &mut *state;

        let Some(source) = state.sources.get_mut(&self.source_name) else {
            bail!("source {} was deleted", self.source_name);
        };
        let sequence_number = source.next_sequence_number;
        source.next_sequence_number = source.next_sequence_number.wrapping_add(1);

        let msg = ReceivedMessage {
            kind: ReceivedKind::Data,
            topic: source.topic.clone(),
            source_name: self.source_name.clone(),
            sequence_number,
            data: Bytes::copy_from_slice(buf),
            is_handshake,
        };
        for receiver_id in &source.attached {
            if let Some(receiver) = state.receivers.get(receiver_id) {
                let _ = receiver.events.send(DeliveryEvent::Message(msg.clone()));
            }
        }

        if is_handshake {
            state.tap(buf, TapRoute::DataStream { source_name: self.source_name.clone() });
        }
        Ok(())
    }

    async fn delete(&self) -> anyhow::Result<()> {
        let mut state = self.bus.state.lock().await;
        let Some(source) = state.sources.remove(&self.source_name) else {
            bail!("source {} was already deleted", self.source_name);
        };
        debug!("deleting source {}", self.source_name);

        for receiver_id in source.attached {
            if let Some(receiver) = state.receivers.get_mut(&receiver_id) {
                receiver.attached.remove(&self.source_name);
                let _ = receiver.events.send(DeliveryEvent::Message(ReceivedMessage {
                    kind: ReceivedKind::EndOfStream,
                    topic: source.topic.clone(),
                    source_name: self.source_name.clone(),
                    sequence_number: source.next_sequence_number,
                    data: Bytes::new(),
                    is_handshake: false,
                }));
                let _ = receiver.events.send(DeliveryEvent::Detach(self.source_name.clone()));
            }
        }
        Ok(())
    }
}


struct LoopbackReceiver {
    bus: LoopbackBus,
    id: u64,
}

#[async_trait]
impl TopicReceiver for LoopbackReceiver {
    async fn delete(&self) -> anyhow::Result<()> {
        let mut state = self.bus.state.lock().await;
        let Some(receiver) = state.receivers.remove(&self.id) else {
            bail!("receiver {} was already deleted", self.id);
        };
        debug!("deleting receiver {}", self.id);

        for source_name in receiver.attached {
            if let Some(source) = state.sources.get_mut(&source_name) {
                source.attached.remove(&self.id);
            }
            let _ = receiver.events.send(DeliveryEvent::Detach(source_name));
        }
        // dropping the sender ends the delivery loop once pending events are delivered
        Ok(())
    }
}


struct LoopbackImmediateListener {
    bus: LoopbackBus,
    key: (UimAddr, String),
}

#[async_trait]
impl TopicReceiver for LoopbackImmediateListener {
    async fn delete(&self) -> anyhow::Result<()> {
        let mut state = self.bus.state.lock().await;
        if state.immediate_listeners.remove(&self.key).is_none() {
            bail!("listener for {:?} was already deleted", self.key);
        }
        Ok(())
    }
}
