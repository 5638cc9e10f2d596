use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};

use crate::handshake::conn_end::{ConnEnd, UimAddr};

pub const MAX_TOPIC_LEN: usize = 256;
pub const MAX_METADATA_LEN: usize = 64 * 1024;

const TAG_CREQ: &str = "CREQ";
const TAG_CRSP: &str = "CRSP";
const TAG_C_OK: &str = "C_OK";
const TAG_DREQ: &str = "DREQ";
const TAG_DRSP: &str = "DRSP";
const TAG_D_OK: &str = "D_OK";

/// The six handshake messages. Each is an ASCII record `TAG,field_count,...` terminated by a NUL,
///  optionally followed by raw metadata bytes. The field count covers the ASCII fields only,
///  including tag and count themselves, so a topic name containing commas is unambiguous.
///
/// Requests and OKs travel out of band to a process address, responses travel on the source's
///  data stream.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum HandshakeMessage {
    ConnectRequest(ConnectRequestData),
    ConnectResponse(ConnectResponseData),
    ConnectOk(ConnectOkData),
    DisconnectRequest(DisconnectData),
    DisconnectResponse(DisconnectData),
    DisconnectOk(DisconnectOkData),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectRequestData {
    pub rcv: ConnEnd,
    pub topic: String,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectResponseData {
    pub rcv: ConnEnd,
    pub src: ConnEnd,
    pub metadata: Bytes,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectOkData {
    pub rcv: ConnEnd,
    pub src: ConnEnd,
    /// sequence number at which the receiver saw the connect response
    pub start_seq_num: u32,
    pub metadata: Bytes,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DisconnectData {
    pub rcv: ConnEnd,
    pub src: ConnEnd,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DisconnectOkData {
    pub rcv: ConnEnd,
    pub src: ConnEnd,
    /// sequence number at which the receiver saw the disconnect response
    pub end_seq_num: u32,
}

/// Topic names travel as the last field of a connect request, inside the ASCII record. So they
///  must be non-empty printable ASCII that fits the size limit. Commas are fine.
pub fn check_topic(topic: &str) -> anyhow::Result<()> {
    if topic.is_empty() {
        bail!("empty topic");
    }
    if topic.len() > MAX_TOPIC_LEN {
        bail!("topic exceeds {} bytes", MAX_TOPIC_LEN);
    }
    if let Some(c) = topic.chars().find(|c| !c.is_ascii() || c.is_ascii_control()) {
        bail!("topic {:?} contains {:?}, only printable ASCII is supported", topic, c);
    }
    Ok(())
}

pub fn check_metadata(metadata: &[u8]) -> anyhow::Result<()> {
    if metadata.len() > MAX_METADATA_LEN {
        bail!("metadata of {} bytes exceeds the limit of {} bytes", metadata.len(), MAX_METADATA_LEN);
    }
    Ok(())
}

impl HandshakeMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            HandshakeMessage::ConnectRequest(_) => TAG_CREQ,
            HandshakeMessage::ConnectResponse(_) => TAG_CRSP,
            HandshakeMessage::ConnectOk(_) => TAG_C_OK,
            HandshakeMessage::DisconnectRequest(_) => TAG_DREQ,
            HandshakeMessage::DisconnectResponse(_) => TAG_DRSP,
            HandshakeMessage::DisconnectOk(_) => TAG_D_OK,
        }
    }

    fn field_count(&self) -> usize {
        match self {
            HandshakeMessage::ConnectRequest(_) => 6,
            HandshakeMessage::ConnectResponse(_) => 9,
            HandshakeMessage::ConnectOk(_) => 10,
            HandshakeMessage::DisconnectRequest(_) => 8,
            HandshakeMessage::DisconnectResponse(_) => 8,
            HandshakeMessage::DisconnectOk(_) => 9,
        }
    }

    /// The receiver's half of the connection, present in every message
    pub fn rcv(&self) -> &ConnEnd {
        match self {
            HandshakeMessage::ConnectRequest(data) => &data.rcv,
            HandshakeMessage::ConnectResponse(data) => &data.rcv,
            HandshakeMessage::ConnectOk(data) => &data.rcv,
            HandshakeMessage::DisconnectRequest(data) => &data.rcv,
            HandshakeMessage::DisconnectResponse(data) => &data.rcv,
            HandshakeMessage::DisconnectOk(data) => &data.rcv,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let record = match self {
            HandshakeMessage::ConnectRequest(data) =>
                format!("{},{},{},{}", TAG_CREQ, self.field_count(), data.rcv, data.topic),
            HandshakeMessage::ConnectResponse(data) =>
                format!("{},{},{},{},{}", TAG_CRSP, self.field_count(), data.rcv, data.src, data.metadata.len()),
            HandshakeMessage::ConnectOk(data) =>
                format!("{},{},{},{},{},{}", TAG_C_OK, self.field_count(), data.rcv, data.src, data.start_seq_num, data.metadata.len()),
            HandshakeMessage::DisconnectRequest(data) =>
                format!("{},{},{},{}", TAG_DREQ, self.field_count(), data.rcv, data.src),
            HandshakeMessage::DisconnectResponse(data) =>
                format!("{},{},{},{}", TAG_DRSP, self.field_count(), data.rcv, data.src),
            HandshakeMessage::DisconnectOk(data) =>
                format!("{},{},{},{},{}", TAG_D_OK, self.field_count(), data.rcv, data.src, data.end_seq_num),
        };

        buf.put_slice(record.as_bytes());
        buf.put_u8(0);

        match self {
            HandshakeMessage::ConnectResponse(data) => buf.put_slice(&data.metadata),
            HandshakeMessage::ConnectOk(data) => buf.put_slice(&data.metadata),
            _ => {}
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<HandshakeMessage> {
        let Some(nul_ofs) = buf.iter().position(|&b| b == 0) else {
            bail!("handshake message has no terminating NUL");
        };
        if !buf[..nul_ofs].is_ascii() {
            bail!("handshake record is not ASCII");
        }
        let record = std::str::from_utf8(&buf[..nul_ofs])?;
        let trailer = &buf[nul_ofs + 1..];

        let (tag, rest) = record.split_once(',')
            .ok_or_else(|| anyhow!("handshake record without fields: {:?}", record))?;
        let (field_count, fields) = rest.split_once(',')
            .ok_or_else(|| anyhow!("handshake record without field count: {:?}", record))?;
        let field_count = field_count.parse::<usize>()
            .map_err(|e| anyhow!("invalid field count in handshake record {:?}: {}", record, e))?;

        match tag {
            TAG_CREQ => Self::deser_connect_request(field_count, fields, trailer),
            TAG_CRSP => Self::deser_connect_response(field_count, fields, trailer),
            TAG_C_OK => Self::deser_connect_ok(field_count, fields, trailer),
            TAG_DREQ => Ok(HandshakeMessage::DisconnectRequest(Self::deser_disconnect(TAG_DREQ, field_count, fields, trailer)?)),
            TAG_DRSP => Ok(HandshakeMessage::DisconnectResponse(Self::deser_disconnect(TAG_DRSP, field_count, fields, trailer)?)),
            TAG_D_OK => Self::deser_disconnect_ok(field_count, fields, trailer),
            _ => Err(anyhow!("invalid handshake tag {:?}", tag)),
        }
    }

    fn deser_connect_request(field_count: usize, fields: &str, trailer: &[u8]) -> anyhow::Result<HandshakeMessage> {
        check_field_count(TAG_CREQ, field_count, 6)?;
        check_no_trailer(TAG_CREQ, trailer)?;

        // the topic is the remainder of the record and may itself contain commas
        let fields = fields.splitn(4, ',').collect::<Vec<_>>();
        let [ct_id, uim_addr, conn_id, topic] = fields.as_slice() else {
            bail!("{}: expected {} fields, found {}", TAG_CREQ, field_count, fields.len() + 2);
        };
        check_topic(topic).map_err(|e| anyhow!("{}: {}", TAG_CREQ, e))?;

        Ok(HandshakeMessage::ConnectRequest(ConnectRequestData {
            rcv: parse_conn_end(ct_id, uim_addr, conn_id)?,
            topic: topic.to_string(),
        }))
    }

    fn deser_connect_response(field_count: usize, fields: &str, trailer: &[u8]) -> anyhow::Result<HandshakeMessage> {
        check_field_count(TAG_CRSP, field_count, 9)?;
        let fields = split_fields(TAG_CRSP, fields, field_count)?;

        Ok(HandshakeMessage::ConnectResponse(ConnectResponseData {
            rcv: parse_conn_end(fields[0], fields[1], fields[2])?,
            src: parse_conn_end(fields[3], fields[4], fields[5])?,
            metadata: parse_metadata(TAG_CRSP, fields[6], trailer)?,
        }))
    }

    fn deser_connect_ok(field_count: usize, fields: &str, trailer: &[u8]) -> anyhow::Result<HandshakeMessage> {
        check_field_count(TAG_C_OK, field_count, 10)?;
        let fields = split_fields(TAG_C_OK, fields, field_count)?;

        Ok(HandshakeMessage::ConnectOk(ConnectOkData {
            rcv: parse_conn_end(fields[0], fields[1], fields[2])?,
            src: parse_conn_end(fields[3], fields[4], fields[5])?,
            start_seq_num: parse_u32(TAG_C_OK, fields[6])?,
            metadata: parse_metadata(TAG_C_OK, fields[7], trailer)?,
        }))
    }

    fn deser_disconnect(tag: &str, field_count: usize, fields: &str, trailer: &[u8]) -> anyhow::Result<DisconnectData> {
        check_field_count(tag, field_count, 8)?;
        check_no_trailer(tag, trailer)?;
        let fields = split_fields(tag, fields, field_count)?;

        Ok(DisconnectData {
            rcv: parse_conn_end(fields[0], fields[1], fields[2])?,
            src: parse_conn_end(fields[3], fields[4], fields[5])?,
        })
    }

    fn deser_disconnect_ok(field_count: usize, fields: &str, trailer: &[u8]) -> anyhow::Result<HandshakeMessage> {
        check_field_count(TAG_D_OK, field_count, 9)?;
        check_no_trailer(TAG_D_OK, trailer)?;
        let fields = split_fields(TAG_D_OK, fields, field_count)?;

        Ok(HandshakeMessage::DisconnectOk(DisconnectOkData {
            rcv: parse_conn_end(fields[0], fields[1], fields[2])?,
            src: parse_conn_end(fields[3], fields[4], fields[5])?,
            end_seq_num: parse_u32(TAG_D_OK, fields[6])?,
        }))
    }
}

fn check_field_count(tag: &str, declared: usize, expected: usize) -> anyhow::Result<()> {
    if declared != expected {
        bail!("{}: declared field count {} instead of {}", tag, declared, expected);
    }
    Ok(())
}

fn check_no_trailer(tag: &str, trailer: &[u8]) -> anyhow::Result<()> {
    if !trailer.is_empty() {
        bail!("{}: {} unexpected bytes after the record", tag, trailer.len());
    }
    Ok(())
}

/// splits the fields after tag and count, which must be exactly the declared number
fn split_fields<'a>(tag: &str, fields: &'a str, field_count: usize) -> anyhow::Result<Vec<&'a str>> {
    let fields = fields.split(',').collect::<Vec<_>>();
    if fields.len() + 2 != field_count {
        bail!("{}: expected {} fields, found {}", tag, field_count, fields.len() + 2);
    }
    Ok(fields)
}

fn parse_u32(tag: &str, s: &str) -> anyhow::Result<u32> {
    s.parse::<u32>()
        .map_err(|e| anyhow!("{}: invalid number {:?}: {}", tag, s, e))
}

fn parse_conn_end(ct_id: &str, uim_addr: &str, conn_id: &str) -> anyhow::Result<ConnEnd> {
    Ok(ConnEnd {
        ct_id: ct_id.parse()
            .map_err(|e| anyhow!("invalid process id {:?}: {}", ct_id, e))?,
        uim_addr: UimAddr::from_str(uim_addr)?,
        conn_id: conn_id.parse()
            .map_err(|e| anyhow!("invalid connection id {:?}: {}", conn_id, e))?,
    })
}

fn parse_metadata(tag: &str, len: &str, trailer: &[u8]) -> anyhow::Result<Bytes> {
    let len = len.parse::<usize>()
        .map_err(|e| anyhow!("{}: invalid metadata length {:?}: {}", tag, len, e))?;
    if len > MAX_METADATA_LEN {
        bail!("{}: metadata length {} exceeds {}", tag, len, MAX_METADATA_LEN);
    }
    if len != trailer.len() {
        bail!("{}: metadata length {} does not match the {} remaining bytes", tag, len, trailer.len());
    }
    Ok(Bytes::copy_from_slice(trailer))
}
