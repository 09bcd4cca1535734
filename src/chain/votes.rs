//! Aggregation of finalizer votes arriving from the network.
//!
//! Signature verification is the expensive part, so it runs on a
//! dedicated pool; aggregation itself is a cheap update under the
//! target block state's lock. Votes for blocks that have not arrived
//! yet are parked in a small bounded buffer and replayed when the
//! block shows up.

use {
  super::{
    block_state::BlockState,
    controller::ChainEvent,
    fork_db::{ForkDatabase, InUse},
    header_state::HeaderState,
    qc::{VoteMessage, VoteStatus},
  },
  crate::primitives::BlockId,
  std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
  },
  tokio::sync::broadcast,
  tracing::{debug, warn},
};

/// Upper bound on blocks with parked votes.
const MAX_PENDING_BLOCKS: usize = 8;
/// Upper bound on parked votes per block.
const MAX_PENDING_VOTES_PER_BLOCK: usize = 64;
/// Size of the duplicate-suppression window.
const MAX_SEEN_VOTES: usize = 4096;

/// What happened to a processed vote; drives peer scoring in the
/// network layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteOutcome {
  /// Aggregated into the block's certificate-in-progress.
  Accepted,
  /// Aggregated and it completed a quorum.
  Quorum,
  /// Already had this vote.
  Duplicate,
  /// Target block unknown; vote parked.
  Parked,
  /// The signer is not in the target block's active policy.
  UnknownFinalizer,
  /// Signature verification failed.
  BadSignature,
}

pub struct VoteProcessor {
  fork_db: Arc<RwLock<ForkDatabase>>,
  events: broadcast::Sender<ChainEvent>,
  pool: rayon::ThreadPool,
  seen: Mutex<SeenWindow>,
  parked: Mutex<HashMap<BlockId, Vec<VoteMessage>>>,
}

/// Insertion-ordered dedup window with a hard size cap.
#[derive(Default)]
struct SeenWindow {
  set: HashSet<(BlockId, Vec<u8>, bool)>,
  order: VecDeque<(BlockId, Vec<u8>, bool)>,
}

impl SeenWindow {
  /// Returns false when the vote was already recorded.
  fn insert(&mut self, key: (BlockId, Vec<u8>, bool)) -> bool {
    if !self.set.insert(key.clone()) {
      return false;
    }
    self.order.push_back(key);
    while self.order.len() > MAX_SEEN_VOTES {
      if let Some(evicted) = self.order.pop_front() {
        self.set.remove(&evicted);
      }
    }
    true
  }
}

impl VoteProcessor {
  pub fn new(
    fork_db: Arc<RwLock<ForkDatabase>>,
    events: broadcast::Sender<ChainEvent>,
    vote_threads: usize,
  ) -> Self {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(vote_threads.max(1))
      .build()
      .expect("vote pool builds");
    Self {
      fork_db,
      events,
      pool,
      seen: Mutex::new(SeenWindow::default()),
      parked: Mutex::new(HashMap::new()),
    }
  }

  fn find_block(&self, id: &BlockId) -> Option<Arc<BlockState>> {
    let fork = self.fork_db.read().expect("fork db lock");
    let db = match fork.in_use() {
      InUse::Savanna => Some(fork.active()),
      InUse::Both => fork.savanna(),
      InUse::Legacy => None,
    }?;
    db.get_block(id, true)
  }

  /// Verifies and aggregates one incoming vote.
  pub fn process_vote(&self, vote: &VoteMessage) -> VoteOutcome {
    let seen_key =
      (vote.block_id, vote.finalizer_key.0.clone(), vote.strong);
    if !self.seen.lock().expect("seen lock").insert(seen_key) {
      return VoteOutcome::Duplicate;
    }

    let Some(bsp) = self.find_block(&vote.block_id) else {
      self.park(vote.clone());
      return VoteOutcome::Parked;
    };
    self.aggregate(&bsp, vote)
  }

  fn aggregate(&self, bsp: &Arc<BlockState>, vote: &VoteMessage) -> VoteOutcome {
    let HeaderState::Savanna(state) = &bsp.header_state else {
      return VoteOutcome::UnknownFinalizer;
    };
    let Some(index) =
      state.active_finalizer_policy.index_of(&vote.finalizer_key)
    else {
      warn!(
        "vote on {} from a key outside the active policy",
        vote.block_id
      );
      return VoteOutcome::UnknownFinalizer;
    };
    let Some(digests) = bsp.vote_digests() else {
      return VoteOutcome::UnknownFinalizer;
    };

    let digest = if vote.strong { digests.strong } else { digests.weak };
    let verified = self.pool.install(|| {
      vote.finalizer_key.verify(digest.as_ref(), &vote.sig)
    });
    if !verified {
      warn!("bad vote signature on {} at index {index}", vote.block_id);
      return VoteOutcome::BadSignature;
    }

    let status = bsp.with_aggregating_qc(|agg| {
      agg.add_vote(index as u16, vote.strong, vote.sig.clone())
    });
    match status {
      Some(VoteStatus::QuorumReached) => {
        debug!("vote quorum reached on {}", vote.block_id);
        let _ = self.events.send(ChainEvent::AggregatedVote {
          block_id: vote.block_id,
          strong: vote.strong,
        });
        VoteOutcome::Quorum
      }
      Some(VoteStatus::Added) => VoteOutcome::Accepted,
      Some(VoteStatus::Duplicate) => VoteOutcome::Duplicate,
      Some(VoteStatus::UnknownFinalizer) | None => {
        VoteOutcome::UnknownFinalizer
      }
      Some(VoteStatus::InvalidSignature) => VoteOutcome::BadSignature,
    }
  }

  fn park(&self, vote: VoteMessage) {
    let mut parked = self.parked.lock().expect("parked lock");
    if parked.len() >= MAX_PENDING_BLOCKS
      && !parked.contains_key(&vote.block_id)
    {
      // drop votes for the lowest block; it is the least likely to
      // still arrive
      if let Some(oldest) = parked.keys().min_by_key(|id| id.block_num()).copied()
      {
        parked.remove(&oldest);
      }
    }
    let entry = parked.entry(vote.block_id).or_default();
    if entry.len() < MAX_PENDING_VOTES_PER_BLOCK {
      entry.push(vote);
    }
  }

  /// Replays parked votes once their block has been accepted.
  pub fn notify_block(&self, bsp: &Arc<BlockState>) {
    let votes = {
      let mut parked = self.parked.lock().expect("parked lock");
      // prune buffers for blocks that can no longer arrive
      let root_num = {
        let fork = self.fork_db.read().expect("fork db lock");
        fork.active().root().block_num()
      };
      parked.retain(|id, _| id.block_num() > root_num);
      parked.remove(&bsp.id())
    };
    if let Some(votes) = votes {
      debug!("replaying {} parked vote(s) for {}", votes.len(), bsp.id());
      for vote in votes {
        self.aggregate(bsp, &vote);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn seen_window_caps_memory() {
    let mut window = SeenWindow::default();
    for i in 0..(MAX_SEEN_VOTES + 100) {
      let id = BlockId::new(
        crate::primitives::Digest::hash(i.to_le_bytes()),
        i as u32,
      );
      assert!(window.insert((id, vec![1], true)));
    }
    assert_eq!(window.set.len(), MAX_SEEN_VOTES);
    assert_eq!(window.order.len(), MAX_SEEN_VOTES);
  }
}
