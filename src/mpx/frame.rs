//! MPX wire frames.
//!
//! ```text
//! +--------+--------------+-------------+------------------+-----------+
//! | op: u8 | name_len:u16 | name: UTF-8 | payload_len: u32 | payload   |
//! +--------+--------------+-------------+------------------+-----------+
//! ```
//! All integers are big-endian. Handshake frames carry an empty name;
//! channel frames carry a 1..=255 byte channel name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::DynamicBuffer;
use crate::error::{EngineError, Result};
use crate::mpx::version::ProtocolVersion;

/// Fixed bytes before the name.
const PREFIX_LEN: usize = 3;
/// Payload length field.
const LEN_FIELD: usize = 4;
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    PeerType = 0x01,
    Version = 0x02,
    MinimumVersion = 0x03,
    Authenticate = 0x04,
    AuthResult = 0x05,
    ChannelRequest = 0x10,
    ChannelAdded = 0x11,
    ChannelRemoved = 0x12,
    ChannelYield = 0x13,
    ChannelRefused = 0x14,
    TransferInit = 0x20,
    Data = 0x21,
    TransferConfirm = 0x22,
    TransferSkip = 0x23,
}

impl Op {
    fn from_u8(byte: u8) -> Option<Op> {
        Some(match byte {
            0x01 => Op::PeerType,
            0x02 => Op::Version,
            0x03 => Op::MinimumVersion,
            0x04 => Op::Authenticate,
            0x05 => Op::AuthResult,
            0x10 => Op::ChannelRequest,
            0x11 => Op::ChannelAdded,
            0x12 => Op::ChannelRemoved,
            0x13 => Op::ChannelYield,
            0x14 => Op::ChannelRefused,
            0x20 => Op::TransferInit,
            0x21 => Op::Data,
            0x22 => Op::TransferConfirm,
            0x23 => Op::TransferSkip,
            _ => return None,
        })
    }

    /// Channel frames name a channel; handshake frames do not.
    pub fn is_channel_op(&self) -> bool {
        (*self as u8) >= 0x10
    }
}

/// Which end of the multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Client,
    Server,
}

impl PeerRole {
    fn wire(self) -> u8 {
        match self {
            PeerRole::Client => 1,
            PeerRole::Server => 2,
        }
    }

    pub fn opposite(self) -> PeerRole {
        match self {
            PeerRole::Client => PeerRole::Server,
            PeerRole::Server => PeerRole::Client,
        }
    }
}

/// Which transfer a `TransferSkip` abandons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipKind {
    /// The sender cancels its own outgoing transfer.
    Cancelled,
    /// The receiver refuses an incoming transfer.
    Refused,
}

impl SkipKind {
    fn wire(self) -> u8 {
        match self {
            SkipKind::Cancelled => 0,
            SkipKind::Refused => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: Op,
    pub channel: String,
    pub payload: Bytes,
}

fn malformed(op: Op, what: &str) -> EngineError {
    EngineError::MalformedFrame(format!("{:?}: {}", op, what))
}

impl Frame {
    fn control(op: Op, payload: Bytes) -> Self {
        Self {
            op,
            channel: String::new(),
            payload,
        }
    }

    fn channel(op: Op, name: &str, payload: Bytes) -> Self {
        Self {
            op,
            channel: name.to_string(),
            payload,
        }
    }

    fn version_payload(v: ProtocolVersion) -> Bytes {
        let mut b = BytesMut::with_capacity(4);
        b.put_u16(v.major);
        b.put_u16(v.minor);
        b.freeze()
    }

    pub fn peer_type(role: PeerRole) -> Self {
        Self::control(Op::PeerType, Bytes::copy_from_slice(&[role.wire()]))
    }

    pub fn version(v: ProtocolVersion) -> Self {
        Self::control(Op::Version, Self::version_payload(v))
    }

    pub fn minimum_version(v: ProtocolVersion) -> Self {
        Self::control(Op::MinimumVersion, Self::version_payload(v))
    }

    pub fn authenticate(token: &[u8]) -> Self {
        Self::control(Op::Authenticate, Bytes::copy_from_slice(token))
    }

    pub fn auth_result(accepted: bool, reason: &str) -> Self {
        let mut b = BytesMut::with_capacity(1 + reason.len());
        b.put_u8(accepted as u8);
        b.put_slice(reason.as_bytes());
        Self::control(Op::AuthResult, b.freeze())
    }

    pub fn channel_request(name: &str) -> Self {
        Self::channel(Op::ChannelRequest, name, Bytes::new())
    }

    pub fn channel_added(name: &str) -> Self {
        Self::channel(Op::ChannelAdded, name, Bytes::new())
    }

    pub fn channel_removed(name: &str) -> Self {
        Self::channel(Op::ChannelRemoved, name, Bytes::new())
    }

    pub fn channel_yield(name: &str) -> Self {
        Self::channel(Op::ChannelYield, name, Bytes::new())
    }

    pub fn channel_refused(name: &str, reason: &str) -> Self {
        Self::channel(Op::ChannelRefused, name, Bytes::copy_from_slice(reason.as_bytes()))
    }

    pub fn transfer_init(name: &str, total: u64, encoding: u8) -> Self {
        let mut b = BytesMut::with_capacity(9);
        b.put_u64(total);
        b.put_u8(encoding);
        Self::channel(Op::TransferInit, name, b.freeze())
    }

    pub fn data(name: &str, chunk: Bytes) -> Self {
        Self::channel(Op::Data, name, chunk)
    }

    pub fn transfer_confirm(name: &str, received: u64) -> Self {
        let mut b = BytesMut::with_capacity(8);
        b.put_u64(received);
        Self::channel(Op::TransferConfirm, name, b.freeze())
    }

    /// `seq` is the channel-local ordinal of the abandoned transfer in
    /// its sending direction, counting `TransferInit` frames from 1.
    pub fn transfer_skip(name: &str, kind: SkipKind, seq: u32) -> Self {
        let mut b = BytesMut::with_capacity(5);
        b.put_u8(kind.wire());
        b.put_u32(seq);
        Self::channel(Op::TransferSkip, name, b.freeze())
    }

    // --- payload accessors ---

    pub fn role(&self) -> Result<PeerRole> {
        match self.payload.as_ref() {
            [1] => Ok(PeerRole::Client),
            [2] => Ok(PeerRole::Server),
            _ => Err(malformed(self.op, "bad peer type")),
        }
    }

    pub fn protocol_version(&self) -> Result<ProtocolVersion> {
        if self.payload.len() != 4 {
            return Err(malformed(self.op, "version payload must be 4 bytes"));
        }
        let mut p = self.payload.clone();
        Ok(ProtocolVersion::new(p.get_u16(), p.get_u16()))
    }

    pub fn auth_outcome(&self) -> Result<(bool, String)> {
        let Some((&flag, reason)) = self.payload.split_first() else {
            return Err(malformed(self.op, "empty auth result"));
        };
        Ok((flag != 0, String::from_utf8_lossy(reason).into_owned()))
    }

    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// `(total, encoding)` of a `TransferInit`.
    pub fn transfer_header(&self) -> Result<(u64, u8)> {
        if self.payload.len() != 9 {
            return Err(malformed(self.op, "transfer init payload must be 9 bytes"));
        }
        let mut p = self.payload.clone();
        Ok((p.get_u64(), p.get_u8()))
    }

    /// `(kind, seq)` of a `TransferSkip`.
    pub fn skip_header(&self) -> Result<(SkipKind, u32)> {
        if self.payload.len() != 5 {
            return Err(malformed(self.op, "skip payload must be 5 bytes"));
        }
        let mut p = self.payload.clone();
        let kind = match p.get_u8() {
            0 => SkipKind::Cancelled,
            1 => SkipKind::Refused,
            _ => return Err(malformed(self.op, "bad skip kind")),
        };
        Ok((kind, p.get_u32()))
    }

    pub fn confirmed_bytes(&self) -> Result<u64> {
        if self.payload.len() != 8 {
            return Err(malformed(self.op, "confirm payload must be 8 bytes"));
        }
        Ok(self.payload.clone().get_u64())
    }

    /// Bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.channel.len() + LEN_FIELD + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.op as u8);
        dst.put_u16(self.channel.len() as u16);
        dst.put_slice(self.channel.as_bytes());
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Append this frame to a transmit buffer.
    pub fn write_to(&self, tx: &mut DynamicBuffer) -> Result<()> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut out);
        tx.append(&out)?;
        Ok(())
    }
}

/// Validate a channel name for use on the wire.
pub fn check_channel_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::MalformedFrame(format!(
            "channel name must be 1..={} bytes, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    Ok(())
}

/// Take one complete frame off the front of `rx`.
///
/// Returns `Ok(None)` when more bytes are needed. Nothing is consumed
/// unless a whole frame is available.
pub fn decode(rx: &mut DynamicBuffer, max_frame_size: usize) -> Result<Option<Frame>> {
    if rx.count() < PREFIX_LEN {
        return Ok(None);
    }
    let mut prefix = rx.peek(PREFIX_LEN);
    let op_byte = prefix.get_u8();
    let op = Op::from_u8(op_byte)
        .ok_or_else(|| EngineError::MalformedFrame(format!("unknown opcode 0x{:02x}", op_byte)))?;
    let name_len = prefix.get_u16() as usize;

    if op.is_channel_op() {
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(malformed(op, "channel name length out of range"));
        }
    } else if name_len != 0 {
        return Err(malformed(op, "handshake frame carries a name"));
    }

    let head_len = PREFIX_LEN + name_len + LEN_FIELD;
    if rx.count() < head_len {
        return Ok(None);
    }
    let mut head = rx.peek(head_len);
    head.advance(PREFIX_LEN + name_len);
    let payload_len = head.get_u32() as usize;
    if payload_len > max_frame_size {
        return Err(EngineError::BufferOverflow {
            len: payload_len,
            max: max_frame_size,
        });
    }
    if rx.count() < head_len + payload_len {
        return Ok(None);
    }

    let mut raw = rx.consume(head_len + payload_len);
    raw.advance(PREFIX_LEN);
    let name = raw.split_to(name_len);
    let channel = std::str::from_utf8(&name)
        .map_err(|_| malformed(op, "channel name is not utf-8"))?
        .to_string();
    raw.advance(LEN_FIELD);

    Ok(Some(Frame {
        op,
        channel,
        payload: raw,
    }))
}
