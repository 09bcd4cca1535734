//! The peer-to-peer layer: framed TCP transport, handshake and clock
//! sync, per-peer prioritized send queues, block-range catch-up,
//! dedup/relay policy and connection lifecycle management.

mod connection;
mod connections;
mod dispatch;
mod sync;
mod wire;

pub use {
  connection::{Peer, QueueKind},
  connections::{
    AllowedConnection,
    EndpointKind,
    ListenEndpoint,
    Net,
    NetConfig,
    NetEvent,
    CONSECUTIVE_BLOCK_NACKS_THRESHOLD,
  },
  dispatch::{DispatchManager, TRX_NOTICE_SIZE_THRESHOLD},
  sync::{ChainInfo, SyncManager, SyncState},
  wire::{
    GoAwayReason,
    HandshakeMessage,
    MessageCodec,
    NetMessage,
    ProtoVersion,
    WireError,
    NET_VERSION_BASE,
    NET_VERSION_RANGE,
  },
};
