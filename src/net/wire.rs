//! The peer wire protocol.
//!
//! Frames are `u32 LE length ‖ unsigned-varint tag ‖ bincode payload`.
//! Tags are stable; new messages append new tags and bump the
//! announced protocol version.

use {
  crate::{
    chain::{PackedTransaction, SignedBlock, VoteMessage},
    primitives::{BlockId, Digest, Pubkey, TimePoint, TransactionId},
  },
  bytes::{Buf, BufMut, BytesMut},
  serde::{Deserialize, Serialize},
  thiserror::Error,
  tokio_util::codec::{Decoder, Encoder},
};

/// Base of the announced protocol version number.
pub const NET_VERSION_BASE: u16 = 0x04b5;
/// Sanity range for announced versions.
pub const NET_VERSION_RANGE: u16 = 106;

/// Protocol capabilities in announcement order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u16)]
pub enum ProtoVersion {
  Base = 0,
  ExplicitSync = 1,
  BlockIdNotify = 2, // reserved; feature was removed
  LeapInitial = 7,
  BlockRange = 8,
  Savanna = 9,
  BlockNack = 10,
  GossipBpPeers = 11,
  TrxNotice = 12,
}

pub const NET_VERSION_MAX: ProtoVersion = ProtoVersion::TrxNotice;

impl ProtoVersion {
  /// Maps an announced wire version to the capability level, clamping
  /// unknown ordinals down.
  pub fn from_announced(announced: u16) -> Option<ProtoVersion> {
    let ordinal = announced.checked_sub(NET_VERSION_BASE)?;
    if ordinal > NET_VERSION_RANGE {
      return None;
    }
    use ProtoVersion::*;
    let all = [
      Base,
      ExplicitSync,
      BlockIdNotify,
      LeapInitial,
      BlockRange,
      Savanna,
      BlockNack,
      GossipBpPeers,
      TrxNotice,
    ];
    Some(
      all
        .into_iter()
        .rev()
        .find(|v| (*v as u16) <= ordinal)
        .unwrap_or(Base),
    )
  }

  pub fn announced(self) -> u16 {
    NET_VERSION_BASE + self as u16
  }
}

#[derive(
  Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize,
)]
pub enum GoAwayReason {
  NoReason,
  ItsSelf,
  Duplicate,
  WrongChain,
  WrongVersion,
  Forked,
  Unlinkable,
  BadTransaction,
  Validation,
  BenignOther,
  FatalOther,
  Authentication,
}

impl GoAwayReason {
  /// Fatal reasons suppress reconnect entirely; `BenignOther` defers
  /// it.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      GoAwayReason::ItsSelf
        | GoAwayReason::WrongChain
        | GoAwayReason::WrongVersion
        | GoAwayReason::Forked
        | GoAwayReason::FatalOther
        | GoAwayReason::Authentication
    )
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMessage {
  pub network_version: u16,
  pub chain_id: Digest,
  pub node_id: Digest,
  /// Authentication key; all zeroes when none is configured.
  pub key: Pubkey,
  /// Nanoseconds since the unix epoch. Other epochs are rejected.
  pub time: TimePoint,
  pub token: Digest,
  pub sig: Option<ed25519_dalek::Signature>,
  pub p2p_address: String,
  pub fork_db_root_num: u32,
  pub fork_db_root_id: BlockId,
  pub fork_db_head_num: u32,
  pub fork_db_head_id: BlockId,
  pub os: String,
  pub agent: String,
  pub generation: u16,
}

impl HandshakeMessage {
  /// The token is the digest of the timestamp; the signature covers
  /// the token.
  pub fn sign_token(time: TimePoint) -> Digest {
    Digest::hash(time.as_nanos().to_le_bytes())
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainSizeMessage {
  pub last_irreversible_block_num: u32,
  pub last_irreversible_block_id: BlockId,
  pub head_num: u32,
  pub head_id: BlockId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoAwayMessage {
  pub reason: GoAwayReason,
  pub node_id: Digest,
}

/// NTP-style four-timestamp exchange; all values are nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeMessage {
  pub org: i64,
  pub rec: i64,
  pub xmt: i64,
  pub dst: i64,
}

#[derive(
  Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize,
)]
pub enum IdListMode {
  None,
  CatchUp,
  LastIrrCatchUp,
  Normal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderedIds<T> {
  pub mode: IdListMode,
  pub pending: u32,
  pub ids: Vec<T>,
}

impl<T> Default for OrderedIds<T> {
  fn default() -> Self {
    Self { mode: IdListMode::None, pending: 0, ids: vec![] }
  }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NoticeMessage {
  pub known_trx: OrderedIds<TransactionId>,
  pub known_blocks: OrderedIds<BlockId>,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestMessage {
  pub req_trx: OrderedIds<TransactionId>,
  pub req_blocks: OrderedIds<BlockId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestMessage {
  pub start_block: u32,
  pub end_block: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockNackMessage {
  pub id: BlockId,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockNoticeMessage {
  pub prev_id: BlockId,
  pub id: BlockId,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionNoticeMessage {
  pub id: TransactionId,
}

/// A producer-operator-signed endpoint record gossiped among block
/// producers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedBpPeer {
  pub producer: crate::primitives::AccountName,
  pub p2p_address: String,
  pub time: TimePoint,
  pub key: Pubkey,
  pub sig: Option<ed25519_dalek::Signature>,
}

impl SignedBpPeer {
  pub fn signing_digest(&self) -> Digest {
    let mut preimage = self.producer.as_str().as_bytes().to_vec();
    preimage.extend_from_slice(self.p2p_address.as_bytes());
    preimage.extend_from_slice(&self.time.as_nanos().to_le_bytes());
    Digest::hash(&preimage)
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipBpPeersMessage {
  pub peers: Vec<SignedBpPeer>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetMessage {
  Handshake(HandshakeMessage),
  ChainSize(ChainSizeMessage),
  GoAway(GoAwayMessage),
  Time(TimeMessage),
  Notice(NoticeMessage),
  Request(RequestMessage),
  SyncRequest(SyncRequestMessage),
  Block(Box<SignedBlock>),
  PackedTransaction(Box<PackedTransaction>),
  Vote(VoteMessage),
  BlockNack(BlockNackMessage),
  BlockNotice(BlockNoticeMessage),
  GossipBpPeers(GossipBpPeersMessage),
  TransactionNotice(TransactionNoticeMessage),
}

impl NetMessage {
  pub fn tag(&self) -> u64 {
    match self {
      NetMessage::Handshake(_) => 0,
      NetMessage::ChainSize(_) => 1,
      NetMessage::GoAway(_) => 2,
      NetMessage::Time(_) => 3,
      NetMessage::Notice(_) => 4,
      NetMessage::Request(_) => 5,
      NetMessage::SyncRequest(_) => 6,
      NetMessage::Block(_) => 7,
      NetMessage::PackedTransaction(_) => 8,
      NetMessage::Vote(_) => 9,
      NetMessage::BlockNack(_) => 10,
      NetMessage::BlockNotice(_) => 11,
      NetMessage::GossipBpPeers(_) => 12,
      NetMessage::TransactionNotice(_) => 13,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      NetMessage::Handshake(_) => "handshake",
      NetMessage::ChainSize(_) => "chain_size",
      NetMessage::GoAway(_) => "go_away",
      NetMessage::Time(_) => "time",
      NetMessage::Notice(_) => "notice",
      NetMessage::Request(_) => "request",
      NetMessage::SyncRequest(_) => "sync_request",
      NetMessage::Block(_) => "signed_block",
      NetMessage::PackedTransaction(_) => "packed_transaction",
      NetMessage::Vote(_) => "vote",
      NetMessage::BlockNack(_) => "block_nack",
      NetMessage::BlockNotice(_) => "block_notice",
      NetMessage::GossipBpPeers(_) => "gossip_bp_peers",
      NetMessage::TransactionNotice(_) => "transaction_notice",
    }
  }
}

#[derive(Debug, Error)]
pub enum WireError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("message of {0} bytes exceeds the {1} byte limit")]
  OversizedMessage(usize, usize),

  #[error("unknown message tag {0}")]
  UnknownTag(u64),

  #[error("malformed payload for {0}: {1}")]
  Malformed(&'static str, String),
}

/// Length-delimited codec with a per-message size ceiling.
pub struct MessageCodec {
  pub max_message_size: usize,
}

impl Default for MessageCodec {
  fn default() -> Self {
    // headroom above the largest serialized block we relay
    Self { max_message_size: 32 * 1024 * 1024 }
  }
}

fn encode_payload(msg: &NetMessage) -> Result<Vec<u8>, bincode::Error> {
  match msg {
    NetMessage::Handshake(m) => bincode::serialize(m),
    NetMessage::ChainSize(m) => bincode::serialize(m),
    NetMessage::GoAway(m) => bincode::serialize(m),
    NetMessage::Time(m) => bincode::serialize(m),
    NetMessage::Notice(m) => bincode::serialize(m),
    NetMessage::Request(m) => bincode::serialize(m),
    NetMessage::SyncRequest(m) => bincode::serialize(m),
    NetMessage::Block(m) => bincode::serialize(m.as_ref()),
    NetMessage::PackedTransaction(m) => bincode::serialize(m.as_ref()),
    NetMessage::Vote(m) => bincode::serialize(m),
    NetMessage::BlockNack(m) => bincode::serialize(m),
    NetMessage::BlockNotice(m) => bincode::serialize(m),
    NetMessage::GossipBpPeers(m) => bincode::serialize(m),
    NetMessage::TransactionNotice(m) => bincode::serialize(m),
  }
}

fn decode_payload(tag: u64, payload: &[u8]) -> Result<NetMessage, WireError> {
  let malformed = |e: bincode::Error| {
    WireError::Malformed(tag_name(tag), e.to_string())
  };
  Ok(match tag {
    0 => NetMessage::Handshake(bincode::deserialize(payload).map_err(malformed)?),
    1 => NetMessage::ChainSize(bincode::deserialize(payload).map_err(malformed)?),
    2 => NetMessage::GoAway(bincode::deserialize(payload).map_err(malformed)?),
    3 => NetMessage::Time(bincode::deserialize(payload).map_err(malformed)?),
    4 => NetMessage::Notice(bincode::deserialize(payload).map_err(malformed)?),
    5 => NetMessage::Request(bincode::deserialize(payload).map_err(malformed)?),
    6 => {
      NetMessage::SyncRequest(bincode::deserialize(payload).map_err(malformed)?)
    }
    7 => NetMessage::Block(Box::new(
      bincode::deserialize(payload).map_err(malformed)?,
    )),
    8 => NetMessage::PackedTransaction(Box::new(
      bincode::deserialize(payload).map_err(malformed)?,
    )),
    9 => NetMessage::Vote(bincode::deserialize(payload).map_err(malformed)?),
    10 => NetMessage::BlockNack(bincode::deserialize(payload).map_err(malformed)?),
    11 => {
      NetMessage::BlockNotice(bincode::deserialize(payload).map_err(malformed)?)
    }
    12 => NetMessage::GossipBpPeers(
      bincode::deserialize(payload).map_err(malformed)?,
    ),
    13 => NetMessage::TransactionNotice(
      bincode::deserialize(payload).map_err(malformed)?,
    ),
    other => return Err(WireError::UnknownTag(other)),
  })
}

fn tag_name(tag: u64) -> &'static str {
  match tag {
    0 => "handshake",
    1 => "chain_size",
    2 => "go_away",
    3 => "time",
    4 => "notice",
    5 => "request",
    6 => "sync_request",
    7 => "signed_block",
    8 => "packed_transaction",
    9 => "vote",
    10 => "block_nack",
    11 => "block_notice",
    12 => "gossip_bp_peers",
    13 => "transaction_notice",
    _ => "unknown",
  }
}

impl Encoder<&NetMessage> for MessageCodec {
  type Error = WireError;

  fn encode(
    &mut self,
    item: &NetMessage,
    dst: &mut BytesMut,
  ) -> Result<(), Self::Error> {
    let payload = encode_payload(item)
      .map_err(|e| WireError::Malformed(item.kind(), e.to_string()))?;

    let mut tag_buf = unsigned_varint::encode::u64_buffer();
    let tag = unsigned_varint::encode::u64(item.tag(), &mut tag_buf);

    let frame_len = tag.len() + payload.len();
    if frame_len > self.max_message_size {
      return Err(WireError::OversizedMessage(frame_len, self.max_message_size));
    }

    dst.reserve(4 + frame_len);
    dst.put_u32_le(frame_len as u32);
    dst.put_slice(tag);
    dst.put_slice(&payload);
    Ok(())
  }
}

impl Decoder for MessageCodec {
  type Error = WireError;
  type Item = NetMessage;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Self::Item>, Self::Error> {
    if src.len() < 4 {
      return Ok(None);
    }
    let frame_len =
      u32::from_le_bytes(src[..4].try_into().expect("4 bytes")) as usize;
    // reject oversized frames before buffering them
    if frame_len > self.max_message_size {
      return Err(WireError::OversizedMessage(frame_len, self.max_message_size));
    }
    if src.len() < 4 + frame_len {
      src.reserve(4 + frame_len - src.len());
      return Ok(None);
    }
    src.advance(4);
    let frame = src.split_to(frame_len);

    let (tag, payload) = unsigned_varint::decode::u64(&frame)
      .map_err(|e| WireError::Malformed("frame", e.to_string()))?;
    Ok(Some(decode_payload(tag, payload)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_handshake() -> HandshakeMessage {
    HandshakeMessage {
      network_version: NET_VERSION_MAX.announced(),
      chain_id: Digest::hash(b"chain"),
      node_id: Digest::hash(b"node"),
      key: Pubkey::default(),
      time: TimePoint(1_700_000_000_000_000_000),
      token: Digest::default(),
      sig: None,
      p2p_address: "127.0.0.1:9876".into(),
      fork_db_root_num: 10,
      fork_db_root_id: BlockId::new(Digest::hash(b"root"), 10),
      fork_db_head_num: 15,
      fork_db_head_id: BlockId::new(Digest::hash(b"head"), 15),
      os: "linux".into(),
      agent: "veldt test".into(),
      generation: 1,
    }
  }

  #[test]
  fn frame_roundtrip() {
    let mut codec = MessageCodec::default();
    let msg = NetMessage::Handshake(sample_handshake());

    let mut buf = BytesMut::new();
    codec.encode(&msg, &mut buf).unwrap();
    // partial frames decode to None without consuming
    let mut partial = BytesMut::from(&buf[..5]);
    assert!(codec.decode(&mut partial).unwrap().is_none());

    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, msg);
    assert!(buf.is_empty());
  }

  #[test]
  fn tags_are_stable() {
    let msg = NetMessage::Time(TimeMessage { org: 0, rec: 0, xmt: 0, dst: 0 });
    assert_eq!(msg.tag(), 3);
    let notice = NetMessage::BlockNotice(BlockNoticeMessage {
      prev_id: BlockId::default(),
      id: BlockId::default(),
    });
    assert_eq!(notice.tag(), 11);

    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(&msg, &mut buf).unwrap();
    // tag rides directly after the length prefix
    assert_eq!(buf[4], 3);
  }

  #[test]
  fn oversized_frames_rejected() {
    let mut codec = MessageCodec { max_message_size: 16 };
    let msg = NetMessage::Handshake(sample_handshake());
    let mut buf = BytesMut::new();
    assert!(matches!(
      codec.encode(&msg, &mut buf),
      Err(WireError::OversizedMessage(..))
    ));

    let mut incoming = BytesMut::new();
    incoming.put_u32_le(1024);
    assert!(matches!(
      codec.decode(&mut incoming),
      Err(WireError::OversizedMessage(1024, 16))
    ));
  }

  #[test]
  fn version_mapping() {
    assert_eq!(
      ProtoVersion::from_announced(NET_VERSION_BASE),
      Some(ProtoVersion::Base)
    );
    assert_eq!(
      ProtoVersion::from_announced(NET_VERSION_BASE + 10),
      Some(ProtoVersion::BlockNack)
    );
    // unknown ordinals clamp to the nearest lower capability
    assert_eq!(
      ProtoVersion::from_announced(NET_VERSION_BASE + 5),
      Some(ProtoVersion::BlockIdNotify)
    );
    assert_eq!(ProtoVersion::from_announced(NET_VERSION_BASE - 1), None);
    assert_eq!(
      ProtoVersion::from_announced(NET_VERSION_BASE + NET_VERSION_RANGE + 1),
      None
    );
  }

  #[test]
  fn fatal_reasons() {
    assert!(GoAwayReason::WrongChain.is_fatal());
    assert!(GoAwayReason::Authentication.is_fatal());
    assert!(!GoAwayReason::BenignOther.is_fatal());
    assert!(!GoAwayReason::Duplicate.is_fatal());
  }
}
