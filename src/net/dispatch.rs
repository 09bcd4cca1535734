//! Per-peer dedup of blocks and transactions, and the relay policy
//! bookkeeping behind broadcast.

use {
  crate::{
    chain::PackedTransaction,
    primitives::{BlockId, TimePoint, TransactionId},
  },
  dashmap::DashMap,
  std::{collections::HashSet, time::Duration},
  tracing::trace,
};

/// Transactions larger than this go out as a notice first to peers
/// that understand them; the body ships on demand.
pub const TRX_NOTICE_SIZE_THRESHOLD: usize = 1800;

pub struct DispatchManager {
  /// block id -> connections known to have the block (sent or
  /// received).
  blk_state: DashMap<BlockId, HashSet<u64>>,
  /// transaction id -> connections known to have the transaction.
  trx_state: DashMap<TransactionId, HashSet<u64>>,
  /// transaction id -> expiry time for dedup.
  local_txns: DashMap<TransactionId, TimePoint>,
  /// Bodies kept around to answer notice-driven requests.
  trx_bodies: DashMap<TransactionId, PackedTransaction>,
  dedup_ttl: Duration,
}

impl DispatchManager {
  pub fn new(dedup_ttl: Duration) -> Self {
    Self {
      blk_state: DashMap::new(),
      trx_state: DashMap::new(),
      local_txns: DashMap::new(),
      trx_bodies: DashMap::new(),
      dedup_ttl,
    }
  }

  /// Records that a peer has a transaction. Returns false when it
  /// already had it.
  pub fn add_peer_txn(&self, peer: u64, id: TransactionId) -> bool {
    self.trx_state.entry(id).or_default().insert(peer)
  }

  pub fn peer_has_txn(&self, peer: u64, id: &TransactionId) -> bool {
    self
      .trx_state
      .get(id)
      .map(|peers| peers.contains(&peer))
      .unwrap_or(false)
  }

  /// Records that a peer has a block. Returns false when it was
  /// already known to have it.
  pub fn add_peer_block(&self, peer: u64, id: BlockId) -> bool {
    self.blk_state.entry(id).or_default().insert(peer)
  }

  pub fn peer_has_block(&self, peer: u64, id: &BlockId) -> bool {
    self
      .blk_state
      .get(id)
      .map(|peers| peers.contains(&peer))
      .unwrap_or(false)
  }

  pub fn have_block(&self, id: &BlockId) -> bool {
    self.blk_state.contains_key(id)
  }

  /// Seen-set entries below the irreversible root can never be
  /// relayed again.
  pub fn prune_blocks(&self, root_num: u32) {
    self.blk_state.retain(|id, _| id.block_num() > root_num);
  }

  /// Expiry for a dedup entry: the transaction's own expiration or
  /// now + ttl, whichever is sooner.
  fn dedup_expiry(&self, expiration: TimePoint) -> TimePoint {
    let cap = TimePoint::now() + self.dedup_ttl;
    expiration.min(cap)
  }

  pub fn have_txn(&self, id: &TransactionId) -> bool {
    self.local_txns.contains_key(id)
  }

  /// Records a transaction with its body available for relay.
  /// Returns false for duplicates.
  pub fn add_txn(&self, trx: &PackedTransaction) -> bool {
    let id = trx.id();
    let expiry = self.dedup_expiry(trx.expiration());
    if self.local_txns.insert(id, expiry).is_some() {
      return false;
    }
    self.trx_bodies.insert(id, trx.clone());
    true
  }

  /// Records a transaction known only by id (a notice). Returns
  /// false for duplicates.
  pub fn add_txn_notice(
    &self,
    id: TransactionId,
    expiration: TimePoint,
  ) -> bool {
    let expiry = self.dedup_expiry(expiration);
    self.local_txns.insert(id, expiry).is_none()
  }

  pub fn get_txn(&self, id: &TransactionId) -> Option<PackedTransaction> {
    self.trx_bodies.get(id).map(|t| t.clone())
  }

  /// Timer sweep of expired entries; both the dedup index and the
  /// body cache shrink together.
  pub fn expire(&self) {
    let now = TimePoint::now();
    let before = self.local_txns.len();
    self.local_txns.retain(|_, expiry| *expiry > now);
    self.trx_bodies.retain(|id, _| self.local_txns.contains_key(id));
    self.trx_state.retain(|id, _| self.local_txns.contains_key(id));
    let swept = before - self.local_txns.len();
    if swept > 0 {
      trace!("expired {swept} transaction dedup entr(ies)");
    }
  }

  pub fn txn_count(&self) -> usize {
    self.local_txns.len()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::{SignedTransaction, Transaction},
      primitives::Digest,
    },
  };

  fn trx(expiration_ms: i64) -> PackedTransaction {
    PackedTransaction(SignedTransaction {
      transaction: Transaction {
        expiration: TimePoint::from_millis(expiration_ms),
        ref_block_num: 0,
        authorizers: vec![],
        actions: vec![],
      },
      signatures: vec![],
    })
  }

  #[test]
  fn block_seen_set() {
    let dispatch = DispatchManager::new(Duration::from_secs(10));
    let id = BlockId::new(Digest::hash(b"b"), 42);
    assert!(dispatch.add_peer_block(1, id));
    assert!(!dispatch.add_peer_block(1, id));
    assert!(dispatch.add_peer_block(2, id));
    assert!(dispatch.peer_has_block(1, &id));
    assert!(!dispatch.peer_has_block(3, &id));

    // pruned once irreversible
    dispatch.prune_blocks(42);
    assert!(!dispatch.peer_has_block(1, &id));
  }

  #[test]
  fn txn_dedup_and_expiry() {
    let dispatch = DispatchManager::new(Duration::from_secs(3600));
    // already expired on arrival
    let stale = trx(TimePoint::now().as_millis() - 1000);
    assert!(dispatch.add_txn(&stale));
    dispatch.expire();
    assert!(!dispatch.have_txn(&stale.id()));

    let fresh = trx(TimePoint::now().as_millis() + 60_000);
    assert!(dispatch.add_txn(&fresh));
    assert!(!dispatch.add_txn(&fresh));
    dispatch.expire();
    assert!(dispatch.have_txn(&fresh.id()));
    assert!(dispatch.get_txn(&fresh.id()).is_some());
  }

  #[test]
  fn notice_only_entries_have_no_body() {
    let dispatch = DispatchManager::new(Duration::from_secs(10));
    let id = Digest::hash(b"notice-trx");
    assert!(dispatch.add_txn_notice(
      id,
      TimePoint::now() + Duration::from_secs(60)
    ));
    assert!(!dispatch.add_txn_notice(
      id,
      TimePoint::now() + Duration::from_secs(60)
    ));
    assert!(dispatch.have_txn(&id));
    assert!(dispatch.get_txn(&id).is_none());
  }
}
