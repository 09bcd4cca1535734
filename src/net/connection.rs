//! One TCP peer connection.
//!
//! Each peer owns three prioritized send queues (block-sync, general,
//! transactions) drained by a single writer task, an optional
//! byte-rate throttle on the block-sync queue, heartbeat timers and
//! an NTP-style clock-sync estimate. Reading and message handling
//! happen on the connection's reader task in `connections.rs`.

use {
  super::wire::{
    GoAwayReason,
    HandshakeMessage,
    MessageCodec,
    NetMessage,
    ProtoVersion,
    TimeMessage,
    NET_VERSION_MAX,
  },
  crate::primitives::{BlockId, Digest, Keypair, TimePoint},
  bytes::{Bytes, BytesMut},
  std::{
    collections::VecDeque,
    sync::{
      atomic::{
        AtomicBool,
        AtomicI64,
        AtomicU16,
        AtomicU32,
        AtomicU64,
        Ordering,
      },
      Arc,
      Mutex,
    },
    time::{Duration, Instant},
  },
  tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{watch, Notify},
  },
  tokio_util::codec::Encoder,
  tracing::{debug, trace, warn},
};

/// Send priorities, drained in declaration order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueKind {
  BlockSync,
  General,
  Trx,
}

/// A block range this peer asked us to stream.
#[derive(Clone, Copy, Debug)]
pub struct PeerSyncState {
  pub start_block: u32,
  pub end_block: u32,
  pub last_sent: u32,
  /// True when the range came from a block-notice request rather
  /// than an explicit sync request.
  pub from_notice: bool,
}

#[derive(Default)]
struct SendQueues {
  block_sync: VecDeque<Bytes>,
  general: VecDeque<Bytes>,
  trx: VecDeque<Bytes>,
  queued_bytes: usize,
}

/// Token bucket for the optional block-sync rate limit.
struct RateBucket {
  rate: u64,
  tokens: f64,
  refilled: Instant,
}

impl RateBucket {
  fn new(rate: u64) -> Self {
    Self { rate, tokens: rate as f64, refilled: Instant::now() }
  }

  /// Returns how long to wait before `len` bytes may be sent; zero
  /// when they may go now (and are accounted).
  fn admit(&mut self, len: usize) -> Duration {
    let now = Instant::now();
    let elapsed = now.duration_since(self.refilled).as_secs_f64();
    self.refilled = now;
    self.tokens =
      (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
    if self.tokens >= len as f64 {
      self.tokens -= len as f64;
      return Duration::ZERO;
    }
    let deficit = len as f64 - self.tokens;
    Duration::from_secs_f64(deficit / self.rate as f64)
  }
}

pub struct Peer {
  pub id: u64,
  /// Configured dial address for outbound peers, the socket address
  /// for inbound ones.
  pub peer_address: String,
  pub outbound: bool,
  pub accepts_transactions: AtomicBool,
  pub accepts_blocks: AtomicBool,

  queues: Mutex<SendQueues>,
  queue_notify: Notify,
  write_queue_ceiling: usize,
  rate_bucket: Option<Mutex<RateBucket>>,
  pub block_sync_throttling: AtomicBool,

  closed: watch::Sender<bool>,
  pub no_retry: Mutex<GoAwayReason>,

  pub last_received_ns: AtomicI64,
  pub last_block_received_ns: AtomicI64,
  pub last_handshake: Mutex<Option<HandshakeMessage>>,
  pub protocol_version: AtomicU16,
  sent_handshake_count: AtomicU16,

  /// Smoothed round trip estimate from time messages.
  pub rtt_ns: AtomicI64,
  /// The `xmt` of our last outgoing time message, echoed back as
  /// `org`.
  time_org: AtomicI64,

  pub consecutive_blocks_nacked: AtomicU32,
  pub last_block_nack: Mutex<BlockId>,
  pub last_block_nack_request_id: Mutex<BlockId>,
  pub syncing_from_us: AtomicBool,
  pub peer_requested: Mutex<Option<PeerSyncState>>,
}

impl Peer {
  pub fn new(
    id: u64,
    peer_address: String,
    outbound: bool,
    write_queue_ceiling: usize,
    block_sync_rate_limit: Option<u64>,
  ) -> Arc<Self> {
    let (closed, _) = watch::channel(false);
    Arc::new(Self {
      id,
      peer_address,
      outbound,
      accepts_transactions: AtomicBool::new(true),
      accepts_blocks: AtomicBool::new(true),
      queues: Mutex::new(SendQueues::default()),
      queue_notify: Notify::new(),
      write_queue_ceiling,
      rate_bucket: block_sync_rate_limit.map(|r| Mutex::new(RateBucket::new(r))),
      block_sync_throttling: AtomicBool::new(false),
      closed,
      no_retry: Mutex::new(GoAwayReason::NoReason),
      last_received_ns: AtomicI64::new(TimePoint::now().as_nanos()),
      last_block_received_ns: AtomicI64::new(TimePoint::now().as_nanos()),
      last_handshake: Mutex::new(None),
      protocol_version: AtomicU16::new(ProtoVersion::Base as u16),
      sent_handshake_count: AtomicU16::new(0),
      rtt_ns: AtomicI64::new(0),
      time_org: AtomicI64::new(0),
      consecutive_blocks_nacked: AtomicU32::new(0),
      last_block_nack: Mutex::new(BlockId::default()),
      last_block_nack_request_id: Mutex::new(BlockId::default()),
      syncing_from_us: AtomicBool::new(false),
      peer_requested: Mutex::new(None),
    })
  }

  pub fn is_closed(&self) -> bool {
    *self.closed.borrow()
  }

  pub fn closed_watch(&self) -> watch::Receiver<bool> {
    self.closed.subscribe()
  }

  /// Marks the connection closed; the writer and reader tasks unwind
  /// on their next poll.
  pub fn close(&self, reason: GoAwayReason) {
    if self.is_closed() {
      return;
    }
    if reason != GoAwayReason::NoReason {
      *self.no_retry.lock().expect("no_retry lock") = reason;
    }
    debug!("closing connection {} ({:?})", self.peer_address, reason);
    // send_replace updates the flag even with no live receivers
    self.closed.send_replace(true);
    self.queue_notify.notify_waiters();
  }

  /// Serializes and queues a message. Overrunning the write-queue
  /// ceiling closes the connection instead of buffering without
  /// bound.
  pub fn enqueue(&self, kind: QueueKind, msg: &NetMessage) {
    if self.is_closed() {
      return;
    }
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    if let Err(e) = codec.encode(msg, &mut buf) {
      warn!("failed to encode {}: {e}", msg.kind());
      return;
    }
    let frame = buf.freeze();

    {
      let mut queues = self.queues.lock().expect("queues lock");
      if queues.queued_bytes + frame.len() > self.write_queue_ceiling {
        drop(queues);
        warn!(
          "write queue overflow on {}, closing",
          self.peer_address
        );
        self.close(GoAwayReason::BenignOther);
        return;
      }
      queues.queued_bytes += frame.len();
      match kind {
        QueueKind::BlockSync => queues.block_sync.push_back(frame),
        QueueKind::General => queues.general.push_back(frame),
        QueueKind::Trx => queues.trx.push_back(frame),
      }
    }
    self.queue_notify.notify_one();
  }

  pub fn queued_bytes(&self) -> usize {
    self.queues.lock().expect("queues lock").queued_bytes
  }

  /// The single writer task. Drains queues in priority order; a
  /// throttled block-sync queue defers to the general and transaction
  /// queues instead of stalling them.
  pub async fn run_writer(self: Arc<Self>, mut socket: OwnedWriteHalf) {
    let mut closed = self.closed_watch();
    loop {
      if self.is_closed() {
        break;
      }

      let (frame, throttle_wait) = self.pick_frame();
      match frame {
        Some(frame) => {
          if let Err(e) = socket.write_all(&frame).await {
            trace!("write failed on {}: {e}", self.peer_address);
            self.close(GoAwayReason::NoReason);
            break;
          }
        }
        None => {
          match throttle_wait {
            Some(wait) => {
              // only throttled block-sync data is pending; general
              // and transaction traffic stays responsive because any
              // enqueue wakes this select immediately
              tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.queue_notify.notified() => {}
                _ = closed.changed() => break,
              }
            }
            None => {
              tokio::select! {
                _ = self.queue_notify.notified() => {}
                _ = closed.changed() => break,
              }
            }
          }
        }
      }
    }
    let _ = socket.shutdown().await;
  }

  /// Picks the next frame per priority, or the duration to wait when
  /// only throttled block-sync data remains.
  fn pick_frame(&self) -> (Option<Bytes>, Option<Duration>) {
    let mut queues = self.queues.lock().expect("queues lock");

    if let Some(front_len) = queues.block_sync.front().map(|f| f.len()) {
      let wait = match &self.rate_bucket {
        Some(bucket) => bucket.lock().expect("bucket lock").admit(front_len),
        None => Duration::ZERO,
      };
      if wait.is_zero() {
        self.block_sync_throttling.store(false, Ordering::Relaxed);
        let frame = queues.block_sync.pop_front().expect("non-empty");
        queues.queued_bytes -= frame.len();
        return (Some(frame), None);
      }
      self.block_sync_throttling.store(true, Ordering::Relaxed);
      if let Some(frame) = queues.general.pop_front() {
        queues.queued_bytes -= frame.len();
        return (Some(frame), None);
      }
      if let Some(frame) = queues.trx.pop_front() {
        queues.queued_bytes -= frame.len();
        return (Some(frame), None);
      }
      return (None, Some(wait));
    }

    if let Some(frame) = queues.general.pop_front() {
      queues.queued_bytes -= frame.len();
      return (Some(frame), None);
    }
    if let Some(frame) = queues.trx.pop_front() {
      queues.queued_bytes -= frame.len();
      return (Some(frame), None);
    }
    (None, None)
  }

  // ---- clock sync -------------------------------------------------

  /// Sends the periodic time ping.
  pub fn send_time_ping(&self) {
    let xmt = TimePoint::now().as_nanos();
    self.time_org.store(xmt, Ordering::Relaxed);
    self.enqueue(
      QueueKind::General,
      &NetMessage::Time(TimeMessage { org: 0, rec: 0, xmt, dst: 0 }),
    );
  }

  /// Handles an incoming time message: either answers a ping or
  /// folds a pong into the round-trip estimate.
  pub fn handle_time_message(&self, msg: &TimeMessage) {
    let dst = TimePoint::now().as_nanos();
    if msg.org == 0 {
      // a ping; reflect it
      self.enqueue(
        QueueKind::General,
        &NetMessage::Time(TimeMessage {
          org: msg.xmt,
          rec: dst,
          xmt: TimePoint::now().as_nanos(),
          dst: 0,
        }),
      );
      return;
    }
    // a pong; only meaningful if it echoes our outstanding ping
    if msg.org != self.time_org.load(Ordering::Relaxed) {
      return;
    }
    let rtt = (dst - msg.org) - (msg.xmt - msg.rec);
    if rtt >= 0 {
      // exponentially smoothed
      let prior = self.rtt_ns.load(Ordering::Relaxed);
      let smoothed = if prior == 0 { rtt } else { (prior * 7 + rtt) / 8 };
      self.rtt_ns.store(smoothed, Ordering::Relaxed);
    }
    self.time_org.store(0, Ordering::Relaxed);
  }

  /// One-way latency expressed in block intervals, for the sync
  /// manager's distance compensation.
  pub fn latency_blocks(&self) -> u32 {
    let rtt_ns = self.rtt_ns.load(Ordering::Relaxed);
    let half_ms = (rtt_ns / 2) / 1_000_000;
    (half_ms as u64 / crate::primitives::BLOCK_INTERVAL_MS) as u32
  }

  // ---- handshake --------------------------------------------------

  pub fn capability(&self) -> ProtoVersion {
    ProtoVersion::from_announced(
      super::wire::NET_VERSION_BASE
        + self.protocol_version.load(Ordering::Relaxed),
    )
    .unwrap_or(ProtoVersion::Base)
  }

  pub fn set_capability(&self, version: ProtoVersion) {
    self.protocol_version.store(version as u16, Ordering::Relaxed);
  }

  pub fn supports(&self, version: ProtoVersion) -> bool {
    self.capability() >= version
  }

  /// Builds and sends our handshake.
  pub fn send_handshake(
    &self,
    chain_id: Digest,
    node_id: Digest,
    p2p_address: String,
    agent: String,
    key: Option<&Keypair>,
    root_num: u32,
    root_id: BlockId,
    head_num: u32,
    head_id: BlockId,
  ) {
    let generation =
      self.sent_handshake_count.fetch_add(1, Ordering::Relaxed) + 1;
    let time = TimePoint::now();
    let token = HandshakeMessage::sign_token(time);
    let (pub_key, sig) = match key {
      Some(keypair) => {
        use ed25519_dalek::Signer;
        (keypair.public(), Some(keypair.sign(token.as_ref())))
      }
      None => (crate::primitives::Pubkey::default(), None),
    };
    let handshake = HandshakeMessage {
      network_version: NET_VERSION_MAX.announced(),
      chain_id,
      node_id,
      key: pub_key,
      time,
      token,
      sig,
      p2p_address,
      fork_db_root_num: root_num,
      fork_db_root_id: root_id,
      fork_db_head_num: head_num,
      fork_db_head_id: head_id,
      os: std::env::consts::OS.to_owned(),
      agent,
      generation,
    };
    trace!(
      "sending handshake generation {generation} to {}",
      self.peer_address
    );
    self.enqueue(QueueKind::General, &NetMessage::Handshake(handshake));
  }

  pub fn record_received(&self) {
    self
      .last_received_ns
      .store(TimePoint::now().as_nanos(), Ordering::Relaxed);
  }

  pub fn record_block_received(&self) {
    let now = TimePoint::now().as_nanos();
    self.last_block_received_ns.store(now, Ordering::Relaxed);
    self.consecutive_blocks_nacked.store(0, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rate_bucket_paces_bytes() {
    let mut bucket = RateBucket::new(1000);
    // a full bucket admits up to its rate immediately
    assert_eq!(bucket.admit(1000), Duration::ZERO);
    // the next kilobyte has to wait about a second
    let wait = bucket.admit(1000);
    assert!(wait > Duration::from_millis(900));
    assert!(wait <= Duration::from_millis(1100));
  }

  #[test]
  fn queue_priorities() {
    let peer = Peer::new(1, "test:0".into(), false, 1 << 20, None);
    let trx = NetMessage::TransactionNotice(super::super::wire::TransactionNoticeMessage {
      id: Digest::hash(b"t"),
    });
    let general = NetMessage::Time(TimeMessage { org: 1, rec: 2, xmt: 3, dst: 4 });

    peer.enqueue(QueueKind::Trx, &trx);
    peer.enqueue(QueueKind::General, &general);

    // general drains before transactions; the tag byte follows the
    // length prefix
    let (first, _) = peer.pick_frame();
    assert_eq!(first.unwrap()[4], 3);
    let (second, _) = peer.pick_frame();
    assert_eq!(second.unwrap()[4], 13);
    assert_eq!(peer.queued_bytes(), 0);
    let (third, wait) = peer.pick_frame();
    assert!(third.is_none() && wait.is_none());
  }

  #[test]
  fn overflow_closes() {
    let peer = Peer::new(1, "test:0".into(), false, 8, None);
    let general = NetMessage::Time(TimeMessage { org: 1, rec: 2, xmt: 3, dst: 4 });
    peer.enqueue(QueueKind::General, &general);
    assert!(peer.is_closed());
  }

  #[test]
  fn pong_updates_rtt() {
    let peer = Peer::new(1, "test:0".into(), false, 1 << 20, None);
    let org = TimePoint::now().as_nanos() - 10_000_000;
    peer.time_org.store(org, Ordering::Relaxed);
    peer.handle_time_message(&TimeMessage {
      org,
      rec: org + 4_000_000,
      xmt: org + 5_000_000,
      dst: 0,
    });
    let rtt = peer.rtt_ns.load(Ordering::Relaxed);
    assert!(rtt > 0);
  }
}
