use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::handshake::conn_end::ConnEnd;
use crate::listener::{ReceiverListener, SourceListener};
use crate::receiver::rcv_conn::RcvConn;
use crate::transport::TopicSource;

pub type SourceId = u64;
pub type ReceiverId = u64;

/// Work for the controller task. Endpoint create / delete commands are submitted by the
///  application and waited for; everything else comes from transport tasks or timers and is
///  fire-and-forget.
pub enum Command {
    SourceCreate(SourceCreateData),
    SourceDelete(SourceId),
    ReceiverCreate(ReceiverCreateData),
    ReceiverDelete(ReceiverId),
    /// a handshake message received out of band, to be handled by the source side
    SrcHandshake(Bytes),
    SrcConnTick {
        key: ConnEnd,
        tmr_id: u32,
    },
    /// the transport attached a source to a connected receiver
    RcvConnCreate(Arc<RcvConn>),
    /// the transport detached a source from a connected receiver
    RcvConnDelete(Arc<RcvConn>),
    RcvConnTick {
        conn: Weak<RcvConn>,
        tmr_id: u32,
    },
    RcvSendConnectOk(Weak<RcvConn>),
    RcvSendDisconnectOk(Weak<RcvConn>),
    EndpointCounts,
    RecentEvents,
    /// echoes back success, or fails on request
    Test {
        fail: bool,
    },
    Quit,
}

pub struct SourceCreateData {
    pub topic: String,
    pub metadata: Bytes,
    pub listener: Arc<dyn SourceListener>,
}

pub struct ReceiverCreateData {
    pub topic: String,
    pub metadata: Bytes,
    pub listener: Arc<dyn ReceiverListener>,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SourceCreate(_) => "SourceCreate",
            Command::SourceDelete(_) => "SourceDelete",
            Command::ReceiverCreate(_) => "ReceiverCreate",
            Command::ReceiverDelete(_) => "ReceiverDelete",
            Command::SrcHandshake(_) => "SrcHandshake",
            Command::SrcConnTick { .. } => "SrcConnTick",
            Command::RcvConnCreate(_) => "RcvConnCreate",
            Command::RcvConnDelete(_) => "RcvConnDelete",
            Command::RcvConnTick { .. } => "RcvConnTick",
            Command::RcvSendConnectOk(_) => "RcvSendConnectOk",
            Command::RcvSendDisconnectOk(_) => "RcvSendDisconnectOk",
            Command::EndpointCounts => "EndpointCounts",
            Command::RecentEvents => "RecentEvents",
            Command::Test { .. } => "Test",
            Command::Quit => "Quit",
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SourceCreate(data) => write!(f, "SourceCreate({:?})", data.topic),
            Command::SourceDelete(id) => write!(f, "SourceDelete({})", id),
            Command::ReceiverCreate(data) => write!(f, "ReceiverCreate({:?})", data.topic),
            Command::ReceiverDelete(id) => write!(f, "ReceiverDelete({})", id),
            Command::SrcHandshake(buf) => write!(f, "SrcHandshake({:?})", String::from_utf8_lossy(&buf[..buf.len().min(4)])),
            Command::SrcConnTick { key, tmr_id } => write!(f, "SrcConnTick({:?}, {})", key, tmr_id),
            Command::RcvConnCreate(conn) => write!(f, "RcvConnCreate({})", conn.source_name()),
            Command::RcvConnDelete(conn) => write!(f, "RcvConnDelete({})", conn.source_name()),
            Command::RcvConnTick { tmr_id, .. } => write!(f, "RcvConnTick({})", tmr_id),
            other => write!(f, "{}", other.name()),
        }
    }
}

pub enum CommandOutput {
    Done,
    SourceCreated {
        id: SourceId,
        transport_source: Arc<dyn TopicSource>,
    },
    ReceiverCreated(ReceiverId),
    EndpointCounts {
        sources: usize,
        receivers: usize,
    },
    RecentEvents(Vec<String>),
}

impl Debug for CommandOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutput::Done => write!(f, "Done"),
            CommandOutput::SourceCreated { id, .. } => write!(f, "SourceCreated({})", id),
            CommandOutput::ReceiverCreated(id) => write!(f, "ReceiverCreated({})", id),
            CommandOutput::EndpointCounts { sources, receivers } => write!(f, "EndpointCounts({}, {})", sources, receivers),
            CommandOutput::RecentEvents(events) => write!(f, "RecentEvents({} events)", events.len()),
        }
    }
}

pub type CommandResult = anyhow::Result<CommandOutput>;

/// A command on its way to the controller, with a reply channel if the submitter waits for it
pub struct CommandEnvelope {
    pub command: Command,
    pub reply: Option<oneshot::Sender<CommandResult>>,
}
