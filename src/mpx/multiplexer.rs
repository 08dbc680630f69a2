//! Steady-state MPX: channel control, transfers and round-robin scheduling.
//!
//! # Responsibilities
//! - Apply channel control frames to the channel dictionary
//! - Reassemble incoming transfers and confirm them
//! - Interleave outgoing transfers, `quantum` bytes per turn
//!
//! # Design Decisions
//! - A refused or unknown channel operation is reported as an event and
//!   the session continues; only wire-level violations are fatal
//! - Writing stops at the transmit high-water mark and resumes when the
//!   driver reports a drained buffer

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::buffer::DynamicBuffer;
use crate::error::{EngineError, Result};
use crate::http::ContentEncoding;
use crate::mpx::channel::{
    ChannelData, ChannelDictionary, Direction, InboundTransfer, Origin, OutPhase,
    OutboundTransfer, TransferState,
};
use crate::mpx::codec::CodecRegistry;
use crate::mpx::frame::{check_channel_name, Frame, Op, PeerRole, SkipKind};
use crate::mpx::session::{ControlState, MpxEvent};

/// Scheduling and size limits.
#[derive(Debug, Clone)]
pub struct MuxSettings {
    /// Largest payload accepted in one frame.
    pub max_frame_size: usize,
    /// Bytes a channel may write per turn.
    pub quantum: usize,
    /// Transmit buffer size at which scheduling pauses.
    pub tx_high_water: usize,
    /// Payloads at least this large go through the preferred codec.
    pub compress_threshold: usize,
    pub preferred_encoding: ContentEncoding,
    /// Largest incoming message; bigger transfers are skipped.
    pub max_message_size: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            quantum: 16 * 1024,
            tx_high_water: 256 * 1024,
            compress_threshold: 8 * 1024,
            preferred_encoding: ContentEncoding::Identity,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

pub struct Multiplexer {
    role: PeerRole,
    settings: MuxSettings,
    codecs: Arc<CodecRegistry>,
    channels: ChannelDictionary,
    requested: BTreeSet<String>,
    control: ControlState,
    outbox: VecDeque<Frame>,
    cursor: Option<String>,
}

impl Multiplexer {
    pub fn new(role: PeerRole, settings: MuxSettings, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            role,
            settings,
            codecs,
            channels: ChannelDictionary::new(),
            requested: BTreeSet::new(),
            control: ControlState::Ready,
            outbox: VecDeque::new(),
            cursor: None,
        }
    }

    pub fn channels(&self) -> &ChannelDictionary {
        &self.channels
    }

    pub fn control(&self) -> ControlState {
        self.control
    }

    pub fn settings(&self) -> &MuxSettings {
        &self.settings
    }

    /// Nothing queued, requested or in flight.
    pub fn is_quiet(&self) -> bool {
        self.outbox.is_empty() && self.requested.is_empty() && self.channels.all_quiet()
    }

    // --- local operations ---

    pub fn request_channel(&mut self, name: &str) -> Result<()> {
        check_channel_name(name)?;
        if self.channels.contains(name) || self.requested.contains(name) {
            return Err(EngineError::DuplicateChannel(name.to_string()));
        }
        self.requested.insert(name.to_string());
        self.outbox.push_back(Frame::channel_request(name));
        Ok(())
    }

    pub fn remove_channel(&mut self, name: &str, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        self.channels.remove(name)?;
        self.outbox.push_back(Frame::channel_removed(name));
        events.push_back(MpxEvent::ChannelRemoved {
            channel: name.to_string(),
        });
        Ok(())
    }

    /// Queue one message on a channel.
    pub fn send(&mut self, name: &str, data: Bytes) -> Result<()> {
        let preferred = self.settings.preferred_encoding;
        let codec = if data.len() >= self.settings.compress_threshold
            && preferred != ContentEncoding::Identity
        {
            self.codecs.get(preferred)
        } else {
            None
        };
        let (payload, encoding) = match codec {
            Some(codec) => (codec.encode(&data)?, preferred),
            None => (data, ContentEncoding::Identity),
        };

        let channel = self.channels.require_mut(name)?;
        channel.outbound.push_back(OutboundTransfer {
            payload,
            offset: 0,
            encoding,
            phase: OutPhase::Pending,
            seq: 0,
        });
        Ok(())
    }

    /// Cancel the current outgoing transfer on a channel. Returns false when
    /// nothing was queued or the transfer was already fully sent.
    pub fn cancel(&mut self, name: &str, events: &mut VecDeque<MpxEvent>) -> Result<bool> {
        let channel = self.channels.require_mut(name)?;
        if !channel.wants_turn() {
            return Ok(false);
        }
        let Some(transfer) = channel.outbound.pop_front() else {
            return Ok(false);
        };
        if transfer.phase == OutPhase::Sending {
            self.outbox
                .push_back(Frame::transfer_skip(name, SkipKind::Cancelled, transfer.seq));
        }
        channel.state = TransferState::Skip;
        channel.direction = Direction::Outgoing;
        events.push_back(MpxEvent::TransferSkipped {
            channel: name.to_string(),
            direction: Direction::Outgoing,
        });
        Ok(true)
    }

    // --- incoming frames ---

    pub fn on_frame(&mut self, frame: Frame, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        let name = frame.channel.as_str();
        match frame.op {
            Op::ChannelRequest => {
                self.control = ControlState::RetrievingChannelRequested;
                self.on_channel_request(name, events)
            }
            Op::ChannelAdded => {
                self.control = ControlState::RetrievingChannelAdded;
                let requested = self.requested.remove(name);
                let origin = if requested { Origin::Local } else { Origin::Remote };
                self.channels.add(ChannelData::new(name, origin))?;
                events.push_back(MpxEvent::ChannelAdded {
                    channel: name.to_string(),
                    origin,
                });
                Ok(())
            }
            Op::ChannelRemoved => {
                self.control = ControlState::RetrievingChannelRemoved;
                match self.channels.remove(name) {
                    Ok(_) => events.push_back(MpxEvent::ChannelRemoved {
                        channel: name.to_string(),
                    }),
                    Err(e) => reject(events, name, &e),
                }
                Ok(())
            }
            Op::ChannelYield => {
                self.control = ControlState::RetrievingChannelYield;
                match self.channels.get_mut(name) {
                    Some(channel) if channel.inbound.is_some() => {
                        channel.state = TransferState::Resume;
                    }
                    Some(_) => {}
                    None => reject(events, name, &EngineError::UnknownChannel(name.to_string())),
                }
                Ok(())
            }
            Op::ChannelRefused => {
                if self.requested.remove(name) {
                    events.push_back(MpxEvent::ChannelRefused {
                        channel: name.to_string(),
                        reason: frame.reason(),
                    });
                } else {
                    tracing::debug!(
                        target: "handler_flow",
                        channel = name,
                        "Refusal for a request no longer pending"
                    );
                }
                Ok(())
            }
            Op::TransferInit => self.on_transfer_init(&frame, events),
            Op::Data => self.on_data(&frame, events),
            Op::TransferConfirm => {
                let received = frame.confirmed_bytes()?;
                let Some(channel) = self.channels.get_mut(name) else {
                    reject(events, name, &EngineError::UnknownChannel(name.to_string()));
                    return Ok(());
                };
                let confirming = channel
                    .outbound
                    .front()
                    .is_some_and(|t| t.phase == OutPhase::Confirming);
                if !confirming {
                    let state = format!("{:?}", channel.state);
                    reject(
                        events,
                        name,
                        &EngineError::InvalidState {
                            operation: "confirm transfer",
                            state,
                        },
                    );
                    return Ok(());
                }
                channel.outbound.pop_front();
                channel.state = TransferState::Done;
                events.push_back(MpxEvent::TransferCompleted {
                    channel: name.to_string(),
                    bytes: received,
                });
                Ok(())
            }
            Op::TransferSkip => {
                let (kind, seq) = frame.skip_header()?;
                let Some(channel) = self.channels.get_mut(name) else {
                    reject(events, name, &EngineError::UnknownChannel(name.to_string()));
                    return Ok(());
                };
                let direction = match kind {
                    // The peer abandoned the transfer it was sending us.
                    SkipKind::Cancelled if channel.in_seq == seq && channel.inbound.is_some() => {
                        channel.inbound = None;
                        Direction::Incoming
                    }
                    // The peer refused the transfer we are sending.
                    SkipKind::Refused
                        if channel
                            .outbound
                            .front()
                            .is_some_and(|t| t.phase != OutPhase::Pending && t.seq == seq) =>
                    {
                        channel.outbound.pop_front();
                        Direction::Outgoing
                    }
                    _ => {
                        tracing::debug!(
                            target: "handler_flow",
                            channel = name,
                            ?kind,
                            seq,
                            "Skip for a transfer no longer running"
                        );
                        return Ok(());
                    }
                };
                channel.state = TransferState::Skip;
                channel.direction = direction;
                events.push_back(MpxEvent::TransferSkipped {
                    channel: name.to_string(),
                    direction,
                });
                Ok(())
            }
            Op::PeerType | Op::Version | Op::MinimumVersion | Op::Authenticate | Op::AuthResult => {
                Err(EngineError::MalformedFrame(format!(
                    "{:?} after the handshake completed",
                    frame.op
                )))
            }
        }
    }

    fn on_channel_request(&mut self, name: &str, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        if self.channels.contains(name) {
            self.outbox
                .push_back(Frame::channel_refused(name, "channel already exists"));
            return Ok(());
        }
        if self.requested.contains(name) {
            // Both sides asked for the same name at once; the server's request wins.
            if self.role == PeerRole::Server {
                self.outbox
                    .push_back(Frame::channel_refused(name, "request crossed"));
                return Ok(());
            }
            self.requested.remove(name);
        }
        self.channels.add(ChannelData::new(name, Origin::Remote))?;
        self.outbox.push_back(Frame::channel_added(name));
        events.push_back(MpxEvent::ChannelAdded {
            channel: name.to_string(),
            origin: Origin::Remote,
        });
        Ok(())
    }

    fn on_transfer_init(&mut self, frame: &Frame, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        let name = frame.channel.as_str();
        let (total, encoding_id) = frame.transfer_header()?;
        let Some(channel) = self.channels.get_mut(name) else {
            reject(events, name, &EngineError::UnknownChannel(name.to_string()));
            return Ok(());
        };
        if channel.inbound.is_some() {
            return Err(EngineError::MalformedFrame(format!(
                "transfer already in progress on '{}'",
                name
            )));
        }
        channel.in_seq = channel.in_seq.wrapping_add(1);
        channel.skipping_inbound = false;

        channel.direction = Direction::Incoming;
        channel.state = TransferState::InitializingIncomingTransfer;

        let encoding = ContentEncoding::from_wire_id(encoding_id)
            .filter(|e| self.codecs.supports(*e));
        let acceptable = total <= self.settings.max_message_size as u64;
        let Some(encoding) = encoding.filter(|_| acceptable) else {
            self.outbox
                .push_back(Frame::transfer_skip(name, SkipKind::Refused, channel.in_seq));
            channel.skipping_inbound = true;
            channel.state = TransferState::Skip;
            events.push_back(MpxEvent::TransferSkipped {
                channel: name.to_string(),
                direction: Direction::Incoming,
            });
            return Ok(());
        };

        channel.inbound = Some(InboundTransfer {
            expected: total,
            encoding,
            data: BytesMut::new(),
        });
        channel.state = TransferState::Start;
        if total == 0 {
            self.complete_inbound(name, events)?;
        }
        Ok(())
    }

    fn on_data(&mut self, frame: &Frame, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        let name = frame.channel.as_str();
        let Some(channel) = self.channels.get_mut(name) else {
            reject(events, name, &EngineError::UnknownChannel(name.to_string()));
            return Ok(());
        };
        let Some(transfer) = channel.inbound.as_mut() else {
            if !channel.skipping_inbound {
                let state = format!("{:?}", channel.state);
                reject(
                    events,
                    name,
                    &EngineError::InvalidState {
                        operation: "receive data",
                        state,
                    },
                );
            }
            return Ok(());
        };

        let received = transfer.data.len() + frame.payload.len();
        if received as u64 > transfer.expected {
            return Err(EngineError::MalformedFrame(format!(
                "'{}' sent {} bytes, announced {}",
                name, received, transfer.expected
            )));
        }
        transfer.data.extend_from_slice(&frame.payload);
        let complete = received as u64 == transfer.expected;
        channel.state = TransferState::ReceivingTransfer;
        if complete {
            self.complete_inbound(name, events)?;
        }
        Ok(())
    }

    fn complete_inbound(&mut self, name: &str, events: &mut VecDeque<MpxEvent>) -> Result<()> {
        let channel = self.channels.require_mut(name)?;
        let Some(transfer) = channel.inbound.take() else {
            return Ok(());
        };
        channel.state = TransferState::ConfirmingIncomingTransfer;
        let codec = self
            .codecs
            .get(transfer.encoding)
            .ok_or_else(|| EngineError::MalformedFrame(format!("no codec for {}", transfer.encoding)))?;
        let data = codec.decode(&transfer.data)?;
        self.outbox
            .push_back(Frame::transfer_confirm(name, transfer.expected));
        channel.state = TransferState::Done;
        events.push_back(MpxEvent::Received {
            channel: name.to_string(),
            data,
        });
        Ok(())
    }

    // --- outgoing bytes ---

    /// Write control frames and scheduled data into `tx`.
    pub fn write_to(&mut self, tx: &mut DynamicBuffer) -> Result<()> {
        self.flush_outbox(tx)?;
        while tx.count() < self.settings.tx_high_water {
            let Some(name) = self.channels.next_turn(self.cursor.as_deref()) else {
                break;
            };
            self.take_turn(&name, tx)?;
            self.cursor = Some(name);
            self.flush_outbox(tx)?;
        }
        Ok(())
    }

    fn flush_outbox(&mut self, tx: &mut DynamicBuffer) -> Result<()> {
        while let Some(frame) = self.outbox.pop_front() {
            frame.write_to(tx)?;
        }
        Ok(())
    }

    fn take_turn(&mut self, name: &str, tx: &mut DynamicBuffer) -> Result<()> {
        let others_waiting = self.channels.others_waiting(name);
        let quantum = self.settings.quantum.max(1);
        let max_frame = self.settings.max_frame_size.max(1);
        let channel = self.channels.require_mut(name)?;
        let next_seq = channel.out_seq.wrapping_add(1);
        let Some(transfer) = channel.outbound.front_mut() else {
            return Ok(());
        };

        let mut announced = false;
        if transfer.phase == OutPhase::Pending {
            transfer.seq = next_seq;
            Frame::transfer_init(
                name,
                transfer.payload.len() as u64,
                transfer.encoding.wire_id(),
            )
            .write_to(tx)?;
            transfer.phase = OutPhase::Sending;
            announced = true;
        }

        let mut budget = quantum;
        let mut wrote = false;
        while budget > 0 && transfer.remaining() > 0 {
            let n = budget.min(max_frame).min(transfer.remaining());
            let chunk = transfer.payload.slice(transfer.offset..transfer.offset + n);
            Frame::data(name, chunk).write_to(tx)?;
            transfer.offset += n;
            budget -= n;
            wrote = true;
        }

        let finished = transfer.remaining() == 0;
        let compressed = transfer.encoding != ContentEncoding::Identity;
        if finished {
            transfer.phase = OutPhase::Confirming;
        }

        channel.direction = Direction::Outgoing;
        if announced {
            channel.out_seq = next_seq;
            channel.state = TransferState::Start;
        }
        if wrote {
            channel.state = if compressed {
                TransferState::SendingCompressedTransfer
            } else {
                TransferState::SendingUncompressedTransfer
            };
        }
        if finished {
            channel.state = TransferState::ConfirmingOutgoingTransfer;
        } else if others_waiting {
            self.outbox.push_back(Frame::channel_yield(name));
            channel.state = TransferState::Resume;
        }
        Ok(())
    }
}

fn reject(events: &mut VecDeque<MpxEvent>, channel: &str, error: &EngineError) {
    tracing::debug!(
        target: "handler_flow",
        channel = channel,
        error = %error,
        "Frame rejected"
    );
    events.push_back(MpxEvent::FrameRejected {
        channel: channel.to_string(),
        error: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPoolSettings};
    use crate::mpx::frame::decode;

    fn mux(role: PeerRole, settings: MuxSettings) -> Multiplexer {
        Multiplexer::new(role, settings, Arc::new(CodecRegistry::new()))
    }

    fn buffer() -> DynamicBuffer {
        DynamicBuffer::new(BufferPool::new(BufferPoolSettings::default()))
    }

    fn frames(tx: &mut DynamicBuffer) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(f) = decode(tx, 1 << 20).unwrap() {
            out.push(f);
        }
        out
    }

    fn open(m: &mut Multiplexer, name: &str) {
        let mut events = VecDeque::new();
        m.on_frame(Frame::channel_request(name), &mut events).unwrap();
        m.outbox.clear();
    }

    #[test]
    fn duplicate_request_is_refused_not_fatal() {
        let mut m = mux(PeerRole::Server, MuxSettings::default());
        let mut events = VecDeque::new();
        m.on_frame(Frame::channel_request("a"), &mut events).unwrap();
        m.on_frame(Frame::channel_request("a"), &mut events).unwrap();

        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        let ops: Vec<Op> = frames(&mut tx).iter().map(|f| f.op).collect();
        assert_eq!(ops, vec![Op::ChannelAdded, Op::ChannelRefused]);
        assert_eq!(m.channels().len(), 1);
    }

    #[test]
    fn duplicate_added_is_fatal() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        let mut events = VecDeque::new();
        m.request_channel("a").unwrap();
        m.on_frame(Frame::channel_added("a"), &mut events).unwrap();
        let err = m.on_frame(Frame::channel_added("a"), &mut events).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateChannel(_)));
    }

    #[test]
    fn unknown_removal_is_reported() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        let mut events = VecDeque::new();
        m.on_frame(Frame::channel_removed("ghost"), &mut events).unwrap();
        assert!(matches!(
            events.pop_front(),
            Some(MpxEvent::FrameRejected { ref channel, .. }) if channel == "ghost"
        ));
        assert_eq!(m.control(), ControlState::RetrievingChannelRemoved);
    }

    #[test]
    fn channels_take_turns_and_yield() {
        let settings = MuxSettings {
            quantum: 4,
            ..MuxSettings::default()
        };
        let mut m = mux(PeerRole::Server, settings);
        open(&mut m, "a");
        open(&mut m, "b");
        m.send("a", Bytes::from_static(b"aaaaaaaa")).unwrap();
        m.send("b", Bytes::from_static(b"bbbb")).unwrap();

        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        let trace: Vec<(Op, String)> = frames(&mut tx)
            .into_iter()
            .map(|f| (f.op, f.channel))
            .collect();
        let expected = vec![
            (Op::TransferInit, "a"),
            (Op::Data, "a"),
            (Op::ChannelYield, "a"),
            (Op::TransferInit, "b"),
            (Op::Data, "b"),
            (Op::Data, "a"),
        ];
        let expected: Vec<(Op, String)> = expected
            .into_iter()
            .map(|(op, c)| (op, c.to_string()))
            .collect();
        assert_eq!(trace, expected);
        assert_eq!(
            m.channels().get("a").unwrap().state(),
            TransferState::ConfirmingOutgoingTransfer
        );
    }

    #[test]
    fn high_water_pauses_scheduling() {
        let settings = MuxSettings {
            quantum: 8,
            tx_high_water: 10,
            ..MuxSettings::default()
        };
        let mut m = mux(PeerRole::Server, settings);
        open(&mut m, "a");
        m.send("a", Bytes::from(vec![1u8; 64])).unwrap();

        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        let first = tx.count();
        m.write_to(&mut tx).unwrap();
        assert_eq!(tx.count(), first);
        assert!(m.channels().get("a").unwrap().pending_bytes() > 0);

        tx.clear();
        m.write_to(&mut tx).unwrap();
        assert!(tx.count() > 0);
    }

    #[test]
    fn incoming_transfer_is_confirmed() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        open(&mut m, "a");
        let mut events = VecDeque::new();
        m.on_frame(Frame::transfer_init("a", 6, 0), &mut events).unwrap();
        m.on_frame(Frame::data("a", Bytes::from_static(b"hel")), &mut events).unwrap();
        m.on_frame(Frame::channel_yield("a"), &mut events).unwrap();
        assert_eq!(m.channels().get("a").unwrap().state(), TransferState::Resume);
        m.on_frame(Frame::data("a", Bytes::from_static(b"lo!")), &mut events).unwrap();

        match events.pop_front() {
            Some(MpxEvent::Received { channel, data }) => {
                assert_eq!(channel, "a");
                assert_eq!(&data[..], b"hello!");
            }
            other => panic!("unexpected event {:?}", other),
        }
        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        let confirm = frames(&mut tx).pop().unwrap();
        assert_eq!(confirm.op, Op::TransferConfirm);
        assert_eq!(confirm.confirmed_bytes().unwrap(), 6);
        assert!(m.is_quiet());
    }

    #[test]
    fn unsupported_encoding_is_skipped() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        open(&mut m, "a");
        let mut events = VecDeque::new();
        m.on_frame(Frame::transfer_init("a", 3, ContentEncoding::Gzip.wire_id()), &mut events)
            .unwrap();
        m.on_frame(Frame::data("a", Bytes::from_static(b"zzz")), &mut events).unwrap();

        assert!(matches!(
            events.pop_front(),
            Some(MpxEvent::TransferSkipped { direction: Direction::Incoming, .. })
        ));
        assert!(events.is_empty());
        assert_eq!(m.channels().get("a").unwrap().state(), TransferState::Skip);
    }

    #[test]
    fn overlong_data_is_fatal() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        open(&mut m, "a");
        let mut events = VecDeque::new();
        m.on_frame(Frame::transfer_init("a", 2, 0), &mut events).unwrap();
        let err = m
            .on_frame(Frame::data("a", Bytes::from_static(b"abc")), &mut events)
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedFrame(_)));
    }

    #[test]
    fn cancel_sends_skip_mid_transfer() {
        let settings = MuxSettings {
            quantum: 2,
            tx_high_water: 4,
            ..MuxSettings::default()
        };
        let mut m = mux(PeerRole::Server, settings);
        open(&mut m, "a");
        m.send("a", Bytes::from(vec![0u8; 32])).unwrap();
        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        tx.clear();

        let mut events = VecDeque::new();
        assert!(m.cancel("a", &mut events).unwrap());
        m.write_to(&mut tx).unwrap();
        let skip = frames(&mut tx);
        assert_eq!(skip.len(), 1);
        assert_eq!(skip[0].op, Op::TransferSkip);
        assert_eq!(skip[0].skip_header().unwrap(), (SkipKind::Cancelled, 1));
        assert!(m.is_quiet());
    }

    #[test]
    fn cancel_after_full_send_is_refused() {
        let mut m = mux(PeerRole::Server, MuxSettings::default());
        open(&mut m, "a");
        m.send("a", Bytes::from_static(b"done")).unwrap();
        let mut tx = buffer();
        m.write_to(&mut tx).unwrap();
        tx.clear();

        let mut events = VecDeque::new();
        assert!(!m.cancel("a", &mut events).unwrap());
        assert!(events.is_empty());
        m.write_to(&mut tx).unwrap();
        assert_eq!(tx.count(), 0);
        assert_eq!(m.channels().get("a").unwrap().pending_bytes(), 0);
    }

    #[test]
    fn stale_cancel_keeps_incoming_transfer() {
        let mut m = mux(PeerRole::Client, MuxSettings::default());
        open(&mut m, "a");
        let mut events = VecDeque::new();
        m.on_frame(Frame::transfer_init("a", 4, 0), &mut events).unwrap();
        m.on_frame(Frame::data("a", Bytes::from_static(b"ab")), &mut events).unwrap();
        m.on_frame(Frame::transfer_skip("a", SkipKind::Cancelled, 7), &mut events)
            .unwrap();
        m.on_frame(Frame::transfer_skip("a", SkipKind::Refused, 1), &mut events)
            .unwrap();
        assert!(events.is_empty());

        m.on_frame(Frame::data("a", Bytes::from_static(b"cd")), &mut events).unwrap();
        assert!(matches!(
            events.pop_front(),
            Some(MpxEvent::Received { ref data, .. }) if &data[..] == b"abcd"
        ));
    }

    fn exchange(
        from: &mut Multiplexer,
        to: &mut Multiplexer,
        events: &mut VecDeque<MpxEvent>,
    ) {
        let mut tx = buffer();
        from.write_to(&mut tx).unwrap();
        for frame in frames(&mut tx) {
            to.on_frame(frame, events).unwrap();
        }
    }

    #[test]
    fn refusal_skips_only_the_refused_direction() {
        let mut a = mux(PeerRole::Server, MuxSettings::default());
        let mut b = mux(
            PeerRole::Client,
            MuxSettings {
                max_message_size: 4,
                quantum: 1,
                tx_high_water: 1,
                ..MuxSettings::default()
            },
        );
        open(&mut a, "c");
        open(&mut b, "c");
        a.send("c", Bytes::from_static(b"12345678")).unwrap();
        b.send("c", Bytes::from_static(b"xyz")).unwrap();

        // `b` is mid-send when it refuses the transfer from `a`.
        let mut a_events = VecDeque::new();
        let mut b_events = VecDeque::new();
        for _ in 0..8 {
            exchange(&mut b, &mut a, &mut a_events);
            exchange(&mut a, &mut b, &mut b_events);
        }

        let rejected = |e: &MpxEvent| matches!(e, MpxEvent::FrameRejected { .. });
        assert!(!a_events.iter().any(rejected), "{:?}", a_events);
        assert!(!b_events.iter().any(rejected), "{:?}", b_events);

        assert!(a_events.iter().any(|e| matches!(
            e,
            MpxEvent::Received { data, .. } if &data[..] == b"xyz"
        )));
        assert!(a_events.iter().any(|e| matches!(
            e,
            MpxEvent::TransferSkipped { direction: Direction::Outgoing, .. }
        )));
        assert!(b_events.iter().any(|e| matches!(
            e,
            MpxEvent::TransferSkipped { direction: Direction::Incoming, .. }
        )));
        assert!(b_events.iter().any(|e| matches!(
            e,
            MpxEvent::TransferCompleted { bytes: 3, .. }
        )));
        assert!(a.is_quiet());
        assert!(b.is_quiet());
    }
}
