use bytes::Bytes;

/// How a connection ended, as reported in the disconnect callback
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnStatus {
    #[default]
    Ok,
    /// the handshake did not complete, or the peer went away without one
    BadClose,
}

/// Connection lifecycle. The source side never enters `TimeWait`, it is freed as soon as the
///  disconnect completes or is given up on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConnState {
    PreCreated,
    Starting,
    Running,
    Ending,
    TimeWait,
}

/// What is known about the remote peer of a connection. Fields are filled in as the handshake
///  progresses, `None` meaning 'not (yet) known'.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerInfo {
    pub status: ConnStatus,
    pub src_metadata: Option<Bytes>,
    pub rcv_metadata: Option<Bytes>,
    /// the transport's name for the source, known on the receiving side only
    pub rcv_source_name: Option<String>,
    pub rcv_start_seq_num: Option<u32>,
    pub rcv_end_seq_num: Option<u32>,
}
