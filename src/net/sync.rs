//! Block-range catch-up.
//!
//! The sync manager is a small state machine over three states:
//! `InSync`, `LibCatchup` (downloading ranges of irreversible
//! history) and `HeadCatchup` (fetching a competing head branch). It
//! makes decisions from handshake numbers compensated by the
//! connection's latency in blocks; the connections layer executes
//! them.

use {
  super::wire::{HandshakeMessage, SyncRequestMessage},
  crate::primitives::BlockId,
  std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
  },
  tracing::{debug, info, warn},
};

/// Headroom below which peers are considered equally current.
const MIN_BLOCKS_DISTANCE: u32 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncState {
  InSync,
  LibCatchup,
  HeadCatchup,
}

/// Our side of the comparison, captured at decision time.
#[derive(Clone, Copy, Debug)]
pub struct ChainInfo {
  pub root_num: u32,
  pub root_id: BlockId,
  pub head_num: u32,
  pub head_id: BlockId,
  /// The controller's applied head; requests never run more than a
  /// span ahead of it outside IRREVERSIBLE mode.
  pub applied_head_num: u32,
}

/// What to do with a peer after evaluating its handshake.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeVerdict {
  /// Peer is current with us; nothing to do.
  InSyncWithUs,
  /// We are far behind this peer's root; answer with our handshake
  /// and catch up through others first.
  SendHandshake,
  /// We have more history than the peer knows; tell it.
  NoticeLastIrrCatchUp,
  /// Peer is ahead; begin range download.
  StartSync,
  /// Peer is behind; offer our head.
  NoticeCatchUp,
  /// Within latency noise.
  Idle,
}

/// A connected peer's sync-relevant numbers, snapshotted by the
/// connections layer.
#[derive(Clone, Copy, Debug)]
pub struct PeerSummary {
  pub id: u64,
  pub latency_blocks: u32,
  pub fork_db_head_num: u32,
  pub fork_db_root_num: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncProgress {
  /// Mid-chunk; keep receiving.
  Continue,
  /// Chunk complete; request the next one.
  RequestNext,
  /// Reached the known irreversible frontier; re-handshake.
  Finished,
}

#[derive(Debug)]
struct SyncInner {
  state: SyncState,
  known_lib_num: u32,
  last_requested_num: u32,
  next_expected_num: u32,
  source: Option<u64>,
  request_sent_at: Option<Instant>,
  /// Sources used recently, for round-robin rotation.
  recent_sources: VecDeque<u64>,
  /// Head id being chased during head catchup.
  head_target: Option<BlockId>,
}

pub struct SyncManager {
  inner: Mutex<SyncInner>,
  sync_fetch_span: u32,
  sync_peer_limit: usize,
  resp_expected: Duration,
  /// IRREVERSIBLE read mode lifts the applied-head gate.
  irreversible_mode: bool,
}

impl SyncManager {
  pub fn new(
    sync_fetch_span: u32,
    sync_peer_limit: usize,
    resp_expected: Duration,
    irreversible_mode: bool,
  ) -> Self {
    Self {
      inner: Mutex::new(SyncInner {
        state: SyncState::InSync,
        known_lib_num: 0,
        last_requested_num: 0,
        next_expected_num: 1,
        source: None,
        request_sent_at: None,
        recent_sources: VecDeque::new(),
        head_target: None,
      }),
      sync_fetch_span,
      sync_peer_limit,
      resp_expected,
      irreversible_mode,
    }
  }

  pub fn state(&self) -> SyncState {
    self.inner.lock().expect("sync lock").state
  }

  pub fn is_lib_catchup(&self) -> bool {
    self.state() == SyncState::LibCatchup
  }

  pub fn source(&self) -> Option<u64> {
    self.inner.lock().expect("sync lock").source
  }

  /// The handshake decision ladder.
  pub fn handle_handshake(
    &self,
    our: &ChainInfo,
    latency_blocks: u32,
    msg: &HandshakeMessage,
  ) -> HandshakeVerdict {
    let nblk = latency_blocks;

    if msg.fork_db_head_id == our.head_id {
      return HandshakeVerdict::InSyncWithUs;
    }
    if our.head_num < msg.fork_db_root_num {
      // the peer's irreversible history starts past our head; it will
      // sync from us once we catch up through someone else
      return HandshakeVerdict::SendHandshake;
    }
    if our.root_num > msg.fork_db_head_num + nblk + MIN_BLOCKS_DISTANCE {
      return HandshakeVerdict::NoticeLastIrrCatchUp;
    }
    if our.head_num + nblk < msg.fork_db_head_num {
      let mut inner = self.inner.lock().expect("sync lock");
      inner.known_lib_num =
        inner.known_lib_num.max(msg.fork_db_head_num);
      if inner.state == SyncState::InSync {
        inner.state = SyncState::LibCatchup;
        inner.next_expected_num = our.head_num + 1;
        info!(
          "entering lib catchup toward block {}",
          inner.known_lib_num
        );
      }
      return HandshakeVerdict::StartSync;
    }
    if our.head_num >= msg.fork_db_head_num + nblk {
      return HandshakeVerdict::NoticeCatchUp;
    }
    HandshakeVerdict::Idle
  }

  /// Records a peer's last-irreversible advertisement and enters
  /// catch-up if it extends past us.
  pub fn note_peer_lib(&self, our: &ChainInfo, peer_lib: u32) {
    let mut inner = self.inner.lock().expect("sync lock");
    inner.known_lib_num = inner.known_lib_num.max(peer_lib);
    if inner.state == SyncState::InSync && peer_lib > our.head_num {
      inner.state = SyncState::LibCatchup;
      inner.next_expected_num = our.head_num + 1;
      info!("entering lib catchup toward block {peer_lib}");
    }
  }

  /// Starts chasing a competing head announced via a catch-up notice.
  pub fn begin_head_catchup(&self, target: BlockId) {
    let mut inner = self.inner.lock().expect("sync lock");
    if inner.state == SyncState::InSync {
      inner.state = SyncState::HeadCatchup;
      inner.head_target = Some(target);
      debug!("entering head catchup toward {target}");
    }
  }

  pub fn head_target(&self) -> Option<BlockId> {
    self.inner.lock().expect("sync lock").head_target
  }

  /// Chooses the next chunk and the peer to fetch it from.
  /// Round-robins over the lowest-latency peers able to serve the
  /// range, skipping recently used sources.
  pub fn next_chunk_request(
    &self,
    our: &ChainInfo,
    peers: &[PeerSummary],
  ) -> Option<(u64, SyncRequestMessage)> {
    let mut inner = self.inner.lock().expect("sync lock");
    if inner.state != SyncState::LibCatchup {
      return None;
    }
    let start = inner.next_expected_num;
    let mut end =
      start.saturating_add(self.sync_fetch_span - 1).min(inner.known_lib_num);
    if !self.irreversible_mode {
      // never run more than a span ahead of the applied head
      end = end.min(our.applied_head_num + self.sync_fetch_span);
    }
    if end < start {
      return None;
    }

    let mut candidates: Vec<&PeerSummary> = peers
      .iter()
      .filter(|p| {
        let needed_end =
          start.saturating_add(self.sync_fetch_span).min(inner.known_lib_num);
        p.fork_db_head_num >= needed_end || p.fork_db_head_num >= end
      })
      .collect();
    if candidates.is_empty() {
      return None;
    }
    candidates.sort_by_key(|p| p.latency_blocks);
    candidates.truncate(self.sync_peer_limit.max(1));

    // rotate away from recently used sources when possible
    let chosen = candidates
      .iter()
      .find(|p| !inner.recent_sources.contains(&p.id))
      .or_else(|| candidates.first())
      .copied()?;

    inner.recent_sources.push_back(chosen.id);
    while inner.recent_sources.len() >= self.sync_peer_limit.max(1) {
      inner.recent_sources.pop_front();
    }
    inner.source = Some(chosen.id);
    inner.last_requested_num = end;
    inner.request_sent_at = Some(Instant::now());
    debug!(
      "requesting sync range {start}..{end} from peer {}",
      chosen.id
    );
    Some((chosen.id, SyncRequestMessage { start_block: start, end_block: end }))
  }

  /// Accounts a block received while syncing.
  pub fn block_received(&self, peer_id: u64, block_num: u32) -> SyncProgress {
    let mut inner = self.inner.lock().expect("sync lock");
    match inner.state {
      SyncState::LibCatchup => {
        if Some(peer_id) == inner.source
          && block_num >= inner.next_expected_num
        {
          inner.next_expected_num = block_num + 1;
        }
        if inner.next_expected_num > inner.known_lib_num {
          inner.state = SyncState::InSync;
          inner.source = None;
          inner.request_sent_at = None;
          info!("lib catchup complete at block {block_num}");
          return SyncProgress::Finished;
        }
        if block_num >= inner.last_requested_num {
          return SyncProgress::RequestNext;
        }
        SyncProgress::Continue
      }
      SyncState::HeadCatchup => SyncProgress::Continue,
      SyncState::InSync => SyncProgress::Continue,
    }
  }

  /// Clears head catchup once the chased head (or a better one) is
  /// ours.
  pub fn head_caught_up(&self) {
    let mut inner = self.inner.lock().expect("sync lock");
    if inner.state == SyncState::HeadCatchup {
      inner.state = SyncState::InSync;
      inner.head_target = None;
    }
  }

  /// True when the current range request has gone unanswered too
  /// long; the caller should reassign.
  pub fn request_timed_out(&self) -> bool {
    let inner = self.inner.lock().expect("sync lock");
    matches!(inner.state, SyncState::LibCatchup)
      && inner
        .request_sent_at
        .map(|at| at.elapsed() > self.resp_expected)
        .unwrap_or(false)
  }

  /// Drops the current source so the next chunk lands elsewhere.
  pub fn reassign(&self, our: &ChainInfo) {
    let mut inner = self.inner.lock().expect("sync lock");
    if let Some(source) = inner.source.take() {
      warn!("sync source {source} timed out; reassigning");
      inner.recent_sources.push_back(source);
    }
    inner.request_sent_at = None;
    inner.next_expected_num = inner.next_expected_num.min(our.head_num + 1);
  }

  /// A block from the sync range failed validation: anchor back to
  /// our irreversible frontier and re-request from someone else.
  pub fn rejected_block(&self, our: &ChainInfo, peer_id: u64) {
    let mut inner = self.inner.lock().expect("sync lock");
    if inner.state != SyncState::LibCatchup {
      return;
    }
    warn!("sync block from peer {peer_id} rejected; resetting to lib");
    inner.next_expected_num = our.root_num + 1;
    inner.last_requested_num = 0;
    inner.source = None;
    inner.request_sent_at = None;
    inner.recent_sources.push_back(peer_id);
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::primitives::Digest,
  };

  fn our(root: u32, head: u32) -> ChainInfo {
    ChainInfo {
      root_num: root,
      root_id: BlockId::new(Digest::hash(b"r"), root),
      head_num: head,
      head_id: BlockId::new(Digest::hash(b"h"), head),
      applied_head_num: head,
    }
  }

  fn handshake(root: u32, head: u32) -> HandshakeMessage {
    HandshakeMessage {
      network_version: super::super::wire::NET_VERSION_MAX.announced(),
      chain_id: Digest::hash(b"chain"),
      node_id: Digest::hash(b"peer"),
      key: Default::default(),
      time: crate::primitives::TimePoint::now(),
      token: Digest::default(),
      sig: None,
      p2p_address: "peer:9876".into(),
      fork_db_root_num: root,
      fork_db_root_id: BlockId::new(Digest::hash(b"pr"), root),
      fork_db_head_num: head,
      fork_db_head_id: BlockId::new(Digest::hash(b"ph"), head),
      os: "linux".into(),
      agent: "test".into(),
      generation: 1,
    }
  }

  fn manager() -> SyncManager {
    SyncManager::new(1000, 3, Duration::from_secs(5), false)
  }

  #[test]
  fn handshake_ladder() {
    let sync = manager();

    // identical heads: in sync
    let ours = our(5, 20);
    let mut msg = handshake(5, 20);
    msg.fork_db_head_id = ours.head_id;
    assert_eq!(
      sync.handle_handshake(&ours, 0, &msg),
      HandshakeVerdict::InSyncWithUs
    );

    // peer's root beyond our head
    assert_eq!(
      sync.handle_handshake(&our(5, 20), 0, &handshake(50, 90)),
      HandshakeVerdict::SendHandshake
    );

    // we have much more history
    assert_eq!(
      sync.handle_handshake(&our(100, 120), 0, &handshake(2, 10)),
      HandshakeVerdict::NoticeLastIrrCatchUp
    );

    // peer far ahead: sync
    assert_eq!(
      sync.handle_handshake(&our(5, 20), 0, &handshake(10, 500)),
      HandshakeVerdict::StartSync
    );
    assert_eq!(sync.state(), SyncState::LibCatchup);

    // peer a bit behind: offer catch up
    let sync = manager();
    assert_eq!(
      sync.handle_handshake(&our(5, 30), 0, &handshake(5, 20)),
      HandshakeVerdict::NoticeCatchUp
    );
  }

  #[test]
  fn latency_compensation_suppresses_noise() {
    let sync = manager();
    // peer nominally ahead by 3 blocks but 5 blocks of latency away
    assert_eq!(
      sync.handle_handshake(&our(5, 20), 5, &handshake(5, 23)),
      HandshakeVerdict::NoticeCatchUp
    );
  }

  #[test]
  fn chunked_range_fetch() {
    let sync = manager();
    let ours = our(5, 20);
    sync.handle_handshake(&ours, 0, &handshake(10, 5000));

    let peers = [
      PeerSummary {
        id: 1,
        latency_blocks: 9,
        fork_db_head_num: 5000,
        fork_db_root_num: 10,
      },
      PeerSummary {
        id: 2,
        latency_blocks: 1,
        fork_db_head_num: 5000,
        fork_db_root_num: 10,
      },
    ];

    // lowest latency peer chosen; span honored
    let (peer, req) = sync.next_chunk_request(&ours, &peers).unwrap();
    assert_eq!(peer, 2);
    assert_eq!(req.start_block, 21);
    assert_eq!(req.end_block, 21 + 1000 - 1);

    // the whole requested chunk arrives
    for num in req.start_block..req.end_block {
      assert_eq!(sync.block_received(2, num), SyncProgress::Continue);
    }
    assert_eq!(
      sync.block_received(2, req.end_block),
      SyncProgress::RequestNext
    );

    // next chunk round-robins to the other peer
    let ours = our(5, req.end_block);
    let (peer, req2) = sync.next_chunk_request(&ours, &peers).unwrap();
    assert_eq!(peer, 1);
    assert_eq!(req2.start_block, req.end_block + 1);
  }

  #[test]
  fn span_gates_on_applied_head() {
    let sync = manager();
    let mut ours = our(5, 20);
    ours.applied_head_num = 10;
    sync.handle_handshake(&ours, 0, &handshake(10, 100_000));

    let peers = [PeerSummary {
      id: 1,
      latency_blocks: 0,
      fork_db_head_num: 100_000,
      fork_db_root_num: 10,
    }];
    let (_, req) = sync.next_chunk_request(&ours, &peers).unwrap();
    // capped at applied head + span, not head + span
    assert_eq!(req.end_block, 10 + 1000);
  }

  #[test]
  fn finishing_at_known_lib() {
    let sync = manager();
    let ours = our(5, 20);
    sync.handle_handshake(&ours, 0, &handshake(10, 25));
    let peers = [PeerSummary {
      id: 7,
      latency_blocks: 0,
      fork_db_head_num: 25,
      fork_db_root_num: 10,
    }];
    let (_, req) = sync.next_chunk_request(&ours, &peers).unwrap();
    assert_eq!(req.end_block, 25);
    for num in 21..=24 {
      sync.block_received(7, num);
    }
    assert_eq!(sync.block_received(7, 25), SyncProgress::Finished);
    assert_eq!(sync.state(), SyncState::InSync);
  }

  #[test]
  fn rejection_resets_to_lib() {
    let sync = manager();
    let ours = our(5, 20);
    sync.handle_handshake(&ours, 0, &handshake(10, 5000));
    let peers = [PeerSummary {
      id: 3,
      latency_blocks: 0,
      fork_db_head_num: 5000,
      fork_db_root_num: 10,
    }];
    sync.next_chunk_request(&ours, &peers).unwrap();
    sync.rejected_block(&ours, 3);
    let inner = sync.inner.lock().unwrap();
    assert_eq!(inner.next_expected_num, 6);
    assert_eq!(inner.source, None);
  }
}
