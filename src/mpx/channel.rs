//! Logical channels of one multiplexed connection.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use crate::error::{EngineError, Result};
use crate::http::ContentEncoding;

/// Transfer progress of a channel. Reflects the most recent transition in
/// either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    InitializingIncomingTransfer,
    InitializingOutgoingTransfer,
    Start,
    ReceivingTransfer,
    SendingUncompressedTransfer,
    SendingCompressedTransfer,
    ConfirmingIncomingTransfer,
    ConfirmingOutgoingTransfer,
    /// The turn ended mid-transfer; continues on the next turn.
    Resume,
    /// The transfer was cancelled and its partial data dropped.
    Skip,
    Done,
}

impl TransferState {
    /// No transfer is running in this state.
    pub fn is_settled(&self) -> bool {
        matches!(self, TransferState::Idle | TransferState::Done | TransferState::Skip)
    }
}

/// Direction of the channel's current (or last) transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Idle,
    Incoming,
    Outgoing,
}

/// Which side asked for the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

/// Message being received on a channel.
#[derive(Debug)]
pub(crate) struct InboundTransfer {
    pub expected: u64,
    pub encoding: ContentEncoding,
    pub data: BytesMut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutPhase {
    Pending,
    Sending,
    Confirming,
}

/// Message queued for sending on a channel.
#[derive(Debug)]
pub(crate) struct OutboundTransfer {
    pub payload: Bytes,
    pub offset: usize,
    pub encoding: ContentEncoding,
    pub phase: OutPhase,
    /// Ordinal of this transfer's `TransferInit` on the channel; 0 until announced.
    pub seq: u32,
}

impl OutboundTransfer {
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

/// One registered channel.
#[derive(Debug)]
pub struct ChannelData {
    name: String,
    pub(crate) state: TransferState,
    pub(crate) direction: Direction,
    origin: Origin,
    pub(crate) inbound: Option<InboundTransfer>,
    pub(crate) outbound: VecDeque<OutboundTransfer>,
    /// `TransferInit` frames written on this channel.
    pub(crate) out_seq: u32,
    /// `TransferInit` frames received on this channel.
    pub(crate) in_seq: u32,
    /// The current incoming transfer was refused; its data frames are dropped.
    pub(crate) skipping_inbound: bool,
}

impl ChannelData {
    pub fn new(name: impl Into<String>, origin: Origin) -> Self {
        Self {
            name: name.into(),
            state: TransferState::Idle,
            direction: Direction::Idle,
            origin,
            inbound: None,
            outbound: VecDeque::new(),
            out_seq: 0,
            in_seq: 0,
            skipping_inbound: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Bytes still to be sent plus bytes still expected.
    pub fn pending_bytes(&self) -> usize {
        let out: usize = self.outbound.iter().map(|t| t.remaining()).sum();
        let inbound = self
            .inbound
            .as_ref()
            .map(|t| (t.expected as usize).saturating_sub(t.data.len()))
            .unwrap_or(0);
        out + inbound
    }

    /// Outbound data is waiting for a turn.
    pub(crate) fn wants_turn(&self) -> bool {
        self.outbound
            .front()
            .is_some_and(|t| t.phase != OutPhase::Confirming)
    }

    pub(crate) fn is_quiet(&self) -> bool {
        self.state.is_settled() && self.inbound.is_none() && self.outbound.is_empty()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            name: self.name.clone(),
            state: self.state,
            direction: self.direction,
            origin: self.origin,
            pending_bytes: self.pending_bytes(),
        }
    }
}

/// Serializable view of a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub state: TransferState,
    pub direction: Direction,
    pub origin: Origin,
    pub pending_bytes: usize,
}

/// Name → channel map with unique keys, iterated in name order.
#[derive(Debug, Default)]
pub struct ChannelDictionary {
    channels: BTreeMap<String, ChannelData>,
}

impl ChannelDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Fails when the name is taken.
    pub fn add(&mut self, channel: ChannelData) -> Result<()> {
        if self.channels.contains_key(channel.name()) {
            return Err(EngineError::DuplicateChannel(channel.name().to_string()));
        }
        self.channels.insert(channel.name().to_string(), channel);
        Ok(())
    }

    /// Unregister a channel. Fails when the name is unknown.
    pub fn remove(&mut self, name: &str) -> Result<ChannelData> {
        self.channels
            .remove(name)
            .ok_or_else(|| EngineError::UnknownChannel(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&ChannelData> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChannelData> {
        self.channels.get_mut(name)
    }

    pub(crate) fn require_mut(&mut self, name: &str) -> Result<&mut ChannelData> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownChannel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelData> {
        self.channels.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub(crate) fn all_quiet(&self) -> bool {
        self.channels.values().all(ChannelData::is_quiet)
    }

    /// Name of the first channel after `cursor` (wrapping) that wants a
    /// turn.
    pub(crate) fn next_turn(&self, cursor: Option<&str>) -> Option<String> {
        let wants = |c: &&ChannelData| c.wants_turn();
        let after = match cursor {
            Some(c) => self
                .channels
                .range::<str, _>((Bound::Excluded(c), Bound::Unbounded))
                .map(|(_, v)| v)
                .find(wants),
            None => None,
        };
        after
            .or_else(|| self.channels.values().find(wants))
            .map(|c| c.name.clone())
    }

    /// Another channel besides `name` wants a turn.
    pub(crate) fn others_waiting(&self, name: &str) -> bool {
        self.channels
            .values()
            .any(|c| c.name != name && c.wants_turn())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels.values().map(ChannelData::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(name: &str) -> ChannelData {
        let mut c = ChannelData::new(name, Origin::Local);
        c.outbound.push_back(OutboundTransfer {
            payload: Bytes::from_static(b"abc"),
            offset: 0,
            encoding: ContentEncoding::Identity,
            phase: OutPhase::Pending,
            seq: 0,
        });
        c
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut dict = ChannelDictionary::new();
        dict.add(ChannelData::new("a", Origin::Local)).unwrap();
        let err = dict.add(ChannelData::new("a", Origin::Remote)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateChannel(ref n) if n == "a"));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("a").unwrap().origin(), Origin::Local);
    }

    #[test]
    fn removing_unknown_is_rejected() {
        let mut dict = ChannelDictionary::new();
        let err = dict.remove("ghost").unwrap_err();
        assert!(matches!(err, EngineError::UnknownChannel(_)));

        dict.add(ChannelData::new("a", Origin::Local)).unwrap();
        assert_eq!(dict.remove("a").unwrap().name(), "a");
        assert!(dict.is_empty());
    }

    #[test]
    fn turns_rotate_in_name_order() {
        let mut dict = ChannelDictionary::new();
        dict.add(queued("b")).unwrap();
        dict.add(ChannelData::new("c", Origin::Local)).unwrap();
        dict.add(queued("a")).unwrap();

        assert_eq!(dict.next_turn(None).as_deref(), Some("a"));
        assert_eq!(dict.next_turn(Some("a")).as_deref(), Some("b"));
        assert_eq!(dict.next_turn(Some("b")).as_deref(), Some("a"));
        assert!(dict.others_waiting("a"));
        assert!(!dict.all_quiet());
    }

    #[test]
    fn pending_bytes_counts_both_directions() {
        let mut c = queued("x");
        c.inbound = Some(InboundTransfer {
            expected: 10,
            encoding: ContentEncoding::Identity,
            data: BytesMut::from(&b"1234"[..]),
        });
        assert_eq!(c.pending_bytes(), 3 + 6);
    }
}
