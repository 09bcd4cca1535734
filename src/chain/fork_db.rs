//! In-memory DAG of validated-or-pending block states rooted at the
//! last irreversible block.
//!
//! Two instances, one holding legacy states and one holding Savanna
//! states, live behind [`ForkDatabase`]. Outside the transition only
//! one is populated; while the transition is in flight both are, so a
//! rollback across the boundary stays consistent.

use {
  super::{block_state::BlockState, error::ForkDbError},
  crate::primitives::BlockId,
  std::{cmp::Ordering, collections::HashMap, sync::Arc},
};

/// Outcome of inserting a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddResult {
  /// The block extends the current best head.
  AppendedToHead,
  /// The block made a different branch the best head.
  ForkSwitch,
  /// Inserted, but some other branch remains best.
  AddedToFork,
  /// Already present.
  Duplicate,
  /// Structurally unacceptable.
  Failure,
}

/// One variant instance of the fork database.
#[derive(Debug)]
pub struct ForkDb {
  root: Arc<BlockState>,
  head: Arc<BlockState>,
  index: HashMap<BlockId, Arc<BlockState>>,
  children: HashMap<BlockId, Vec<BlockId>>,
}

impl ForkDb {
  pub fn new(root: Arc<BlockState>) -> Self {
    Self {
      head: root.clone(),
      root,
      index: HashMap::new(),
      children: HashMap::new(),
    }
  }

  pub fn root(&self) -> &Arc<BlockState> {
    &self.root
  }

  pub fn head(&self) -> &Arc<BlockState> {
    &self.head
  }

  pub fn size(&self) -> usize {
    self.index.len()
  }

  pub fn get_block(
    &self,
    id: &BlockId,
    include_root: bool,
  ) -> Option<Arc<BlockState>> {
    if include_root && self.root.id() == *id {
      return Some(self.root.clone());
    }
    self.index.get(id).cloned()
  }

  pub fn contains(&self, id: &BlockId) -> bool {
    self.index.contains_key(id) || self.root.id() == *id
  }

  /// Inserts a node whose parent is already present.
  pub fn add(
    &mut self,
    bsp: Arc<BlockState>,
    ignore_duplicate: bool,
  ) -> Result<AddResult, ForkDbError> {
    let id = bsp.id();
    if self.index.contains_key(&id) || self.root.id() == id {
      if !ignore_duplicate {
        return Err(ForkDbError::DuplicateBlock { id });
      }
      return Ok(AddResult::Duplicate);
    }

    let previous = bsp.previous();
    let parent = self.get_block(&previous, true).ok_or(
      ForkDbError::UnlinkableBlock { id, previous },
    )?;
    if bsp.block_num() != parent.block_num() + 1 {
      return Err(ForkDbError::HeightMismatch {
        id,
        num: bsp.block_num(),
        expected: parent.block_num() + 1,
      });
    }

    self.index.insert(id, bsp.clone());
    self.children.entry(previous).or_default().push(id);

    let old_head = self.head.id();
    if BlockState::compare_heads(&bsp, &self.head) == Ordering::Greater {
      self.head = bsp;
      if previous == old_head {
        return Ok(AddResult::AppendedToHead);
      }
      return Ok(AddResult::ForkSwitch);
    }
    Ok(AddResult::AddedToFork)
  }

  /// Ancestors of `head_id` (inclusive) down to the root or `stop_id`
  /// (exclusive), newest first.
  pub fn fetch_branch(
    &self,
    head_id: BlockId,
    stop_id: Option<BlockId>,
  ) -> Vec<Arc<BlockState>> {
    let mut branch = vec![];
    let mut cursor = head_id;
    while let Some(state) = self.index.get(&cursor) {
      if Some(cursor) == stop_id {
        break;
      }
      branch.push(state.clone());
      cursor = state.previous();
    }
    branch
  }

  /// Splits the paths to two heads at their common ancestor. Returns
  /// the blocks to apply (ascending toward `new_head`) and the blocks
  /// to unwind (descending from `old_head`).
  pub fn fetch_branch_from(
    &self,
    new_head: BlockId,
    old_head: BlockId,
  ) -> Result<(Vec<Arc<BlockState>>, Vec<Arc<BlockState>>), ForkDbError> {
    let mut apply = vec![];
    let mut unwind = vec![];

    let mut first = self
      .get_block(&new_head, true)
      .ok_or(ForkDbError::UnknownBlock { id: new_head })?;
    let mut second = self
      .get_block(&old_head, true)
      .ok_or(ForkDbError::UnknownBlock { id: old_head })?;

    while first.block_num() > second.block_num() {
      apply.push(first.clone());
      let previous = first.previous();
      first = self
        .get_block(&previous, true)
        .ok_or(ForkDbError::UnknownBlock { id: previous })?;
    }
    while second.block_num() > first.block_num() {
      unwind.push(second.clone());
      let previous = second.previous();
      second = self
        .get_block(&previous, true)
        .ok_or(ForkDbError::UnknownBlock { id: previous })?;
    }
    while first.id() != second.id() {
      apply.push(first.clone());
      unwind.push(second.clone());
      let first_prev = first.previous();
      let second_prev = second.previous();
      first = self
        .get_block(&first_prev, true)
        .ok_or(ForkDbError::UnknownBlock { id: first_prev })?;
      second = self
        .get_block(&second_prev, true)
        .ok_or(ForkDbError::UnknownBlock { id: second_prev })?;
    }

    apply.reverse();
    Ok((apply, unwind))
  }

  /// The ancestor of `head_id` at height `block_num`.
  pub fn search_on_branch(
    &self,
    head_id: BlockId,
    block_num: u32,
    include_root: bool,
  ) -> Option<Arc<BlockState>> {
    if include_root && self.root.block_num() == block_num {
      // only if head_id descends from root, which it always does
      if self.contains(&head_id) {
        return Some(self.root.clone());
      }
    }
    let mut cursor = self.get_block(&head_id, false)?;
    loop {
      match cursor.block_num().cmp(&block_num) {
        Ordering::Equal => return Some(cursor),
        Ordering::Less => return None,
        Ordering::Greater => {
          let previous = cursor.previous();
          cursor = self.get_block(&previous, false)?;
        }
      }
    }
  }

  /// True when `descendant` has `ancestor` on its branch.
  pub fn is_descendant_of(
    &self,
    ancestor: BlockId,
    descendant: BlockId,
  ) -> bool {
    if ancestor == descendant {
      return true;
    }
    self
      .search_on_branch(descendant, ancestor.block_num(), true)
      .map(|b| b.id() == ancestor)
      .unwrap_or(false)
  }

  /// Prunes everything not in the subtree of `id` and makes `id` the
  /// new root.
  pub fn advance_root(&mut self, id: BlockId) -> Result<(), ForkDbError> {
    let new_root = self
      .index
      .get(&id)
      .cloned()
      .ok_or(ForkDbError::UnknownBlock { id })?;

    // the new root must connect back to the current root
    let mut cursor = new_root.previous();
    while cursor != self.root.id() {
      cursor = self
        .index
        .get(&cursor)
        .map(|b| b.previous())
        .ok_or(ForkDbError::OrphanedRoot { id })?;
    }

    // keep only the new root's subtree
    let mut keep = std::collections::HashSet::new();
    let mut queue = self.children.get(&id).cloned().unwrap_or_default();
    while let Some(current) = queue.pop() {
      keep.insert(current);
      queue.extend(self.children.get(&current).cloned().unwrap_or_default());
    }

    self.index.retain(|block_id, _| keep.contains(block_id));
    self
      .children
      .retain(|parent, _| keep.contains(parent) || *parent == id);
    self.root = new_root;
    if !self.contains(&self.head.id()) {
      self.head = self.best_remaining_head();
    }
    Ok(())
  }

  /// Drops the subtree rooted at `id`; used when a block fails to
  /// apply.
  pub fn remove(&mut self, id: BlockId) -> Result<(), ForkDbError> {
    if !self.index.contains_key(&id) {
      return Err(ForkDbError::UnknownBlock { id });
    }
    let parent = self.index[&id].previous();
    if let Some(siblings) = self.children.get_mut(&parent) {
      siblings.retain(|c| *c != id);
    }
    self.remove_subtree(id);
    if !self.contains(&self.head.id()) {
      self.head = self.best_remaining_head();
    }
    Ok(())
  }

  fn remove_subtree(&mut self, id: BlockId) {
    let mut queue = vec![id];
    while let Some(current) = queue.pop() {
      self.index.remove(&current);
      if let Some(children) = self.children.remove(&current) {
        queue.extend(children);
      }
    }
  }

  fn best_remaining_head(&self) -> Arc<BlockState> {
    self
      .index
      .values()
      .max_by(|a, b| BlockState::compare_heads(a, b))
      .cloned()
      .unwrap_or_else(|| self.root.clone())
  }

  /// The highest block whose two-chain conditions are met by locally
  /// aggregated votes (Savanna instances only).
  pub fn pending_savanna_lib_num(&self) -> Option<u32> {
    self
      .index
      .values()
      .filter(|b| b.has_strong_vote_quorum())
      .filter_map(|b| match &b.header_state {
        super::header_state::HeaderState::Savanna(s) => {
          Some(s.core.final_on_strong_qc_block_num)
        }
        _ => None,
      })
      .max()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<BlockState>> {
    self.index.values()
  }
}

/// Which variant instances are live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InUse {
  Legacy,
  Both,
  Savanna,
}

/// The regime-dispatching façade over the two fork database
/// instances.
#[derive(Debug)]
pub struct ForkDatabase {
  legacy: Option<ForkDb>,
  savanna: Option<ForkDb>,
  in_use: InUse,
}

impl ForkDatabase {
  pub fn new_legacy(root: Arc<BlockState>) -> Self {
    Self {
      legacy: Some(ForkDb::new(root)),
      savanna: None,
      in_use: InUse::Legacy,
    }
  }

  pub fn new_savanna(root: Arc<BlockState>) -> Self {
    Self {
      legacy: None,
      savanna: Some(ForkDb::new(root)),
      in_use: InUse::Savanna,
    }
  }

  pub fn in_use(&self) -> InUse {
    self.in_use
  }

  /// The instance that drives fork choice and the apply pipeline.
  /// Legacy keeps driving through the transition until the Savanna
  /// Genesis block is final.
  pub fn active(&self) -> &ForkDb {
    match self.in_use {
      InUse::Legacy | InUse::Both => self.legacy.as_ref().expect("legacy instance"),
      InUse::Savanna => self.savanna.as_ref().expect("savanna instance"),
    }
  }

  pub fn active_mut(&mut self) -> &mut ForkDb {
    match self.in_use {
      InUse::Legacy | InUse::Both => self.legacy.as_mut().expect("legacy instance"),
      InUse::Savanna => self.savanna.as_mut().expect("savanna instance"),
    }
  }

  pub fn savanna(&self) -> Option<&ForkDb> {
    self.savanna.as_ref()
  }

  pub fn savanna_mut(&mut self) -> Option<&mut ForkDb> {
    self.savanna.as_mut()
  }

  /// Starts the transition: the Savanna instance comes alive next to
  /// the legacy one.
  pub fn open_savanna(&mut self, root: Arc<BlockState>) {
    debug_assert_eq!(self.in_use, InUse::Legacy);
    self.savanna = Some(ForkDb::new(root));
    self.in_use = InUse::Both;
  }

  /// Completes the transition: the legacy instance is discarded.
  pub fn discard_legacy(&mut self) {
    debug_assert_eq!(self.in_use, InUse::Both);
    self.legacy = None;
    self.in_use = InUse::Savanna;
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::{
        block::SignedBlock,
        header::{BlockHeader, FinalityExtension, HeaderExtension},
        header_state::{HeaderState, SavannaHeaderState, SavannaNextInput},
        policy::{
          FinalizerAuthority,
          FinalizerPolicy,
          ProducerAuthority,
          ProducerSchedule,
        },
        qc::QcClaim,
      },
      primitives::{BlockId, BlockTimestamp, BlsPubkey, Digest, Pubkey},
    },
  };

  fn schedule() -> ProducerSchedule {
    ProducerSchedule {
      version: 1,
      producers: vec![ProducerAuthority {
        producer_name: "prod".into(),
        signing_key: Pubkey::default(),
      }],
    }
  }

  fn policy() -> FinalizerPolicy {
    FinalizerPolicy {
      generation: 1,
      threshold: 1,
      finalizers: vec![FinalizerAuthority {
        description: "only".into(),
        weight: 1,
        public_key: BlsPubkey(vec![1, 2, 3]),
      }],
    }
  }

  fn header(previous: BlockId, timestamp: u32, claim: QcClaim) -> BlockHeader {
    BlockHeader {
      timestamp: BlockTimestamp(timestamp),
      producer: "prod".into(),
      confirmed: 0,
      previous,
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![HeaderExtension::Finality(FinalityExtension {
        qc_claim: claim,
        new_finalizer_policy_diff: None,
        new_proposer_policy_diff: None,
      })],
    }
  }

  fn dummy_block(header: &BlockHeader) -> std::sync::Arc<SignedBlock> {
    use ed25519_dalek::Signer;
    let keypair: crate::primitives::Keypair =
      "9wkzHU5nqzvAdGPjvXZCsEkUwiHExdE9mTCYLVMzgm81".parse().unwrap();
    std::sync::Arc::new(SignedBlock {
      signed_header: crate::chain::header::SignedBlockHeader {
        header: header.clone(),
        producer_signature: keypair.sign(header.digest().as_ref()),
      },
      transactions: vec![],
      block_extensions: vec![],
    })
  }

  fn genesis_state() -> Arc<BlockState> {
    let genesis_header = header(
      BlockId::new(Digest::hash(b"pre"), 9),
      100,
      QcClaim { block_num: 10, is_strong: false },
    );
    let id = genesis_header.calculate_id();
    let state = SavannaHeaderState::savanna_genesis(
      id,
      genesis_header.clone(),
      policy(),
      schedule(),
    );
    Arc::new(BlockState::new(
      HeaderState::Savanna(state),
      dummy_block(&genesis_header),
      vec![],
      true,
    ))
  }

  fn child_of(
    parent: &Arc<BlockState>,
    timestamp: u32,
    claim: QcClaim,
  ) -> Arc<BlockState> {
    let parent_state = match &parent.header_state {
      HeaderState::Savanna(s) => s,
      _ => panic!("savanna parent"),
    };
    let h = header(parent.id(), timestamp, claim);
    let next = parent_state
      .next(SavannaNextInput {
        header: &h,
        qc_claim: claim,
        new_finalizer_policy: None,
        new_proposer_policy: None,
      })
      .unwrap();
    Arc::new(BlockState::new(
      HeaderState::Savanna(next),
      dummy_block(&h),
      vec![],
      false,
    ))
  }

  #[test]
  fn add_and_head_tracking() {
    let root = genesis_state();
    let root_num = root.block_num();
    let mut db = ForkDb::new(root.clone());

    let weak = QcClaim { block_num: root_num, is_strong: false };
    let b1 = child_of(&root, 101, weak);
    assert_eq!(db.add(b1.clone(), false).unwrap(), AddResult::AppendedToHead);
    assert_eq!(db.head().id(), b1.id());

    assert_eq!(db.add(b1.clone(), true).unwrap(), AddResult::Duplicate);

    // a sibling with the same claim but later timestamp stays a fork
    let b1_late = child_of(&root, 102, weak);
    assert_eq!(db.add(b1_late.clone(), false).unwrap(), AddResult::AddedToFork);
    assert_eq!(db.head().id(), b1.id());

    // extending the sibling with a stronger claim switches the fork
    let b2 = child_of(
      &b1_late,
      103,
      QcClaim { block_num: b1_late.block_num(), is_strong: true },
    );
    assert_eq!(db.add(b2.clone(), false).unwrap(), AddResult::ForkSwitch);
    assert_eq!(db.head().id(), b2.id());
  }

  #[test]
  fn unlinkable_add_fails() {
    let root = genesis_state();
    let mut db = ForkDb::new(root.clone());
    let b1 = child_of(
      &root,
      101,
      QcClaim { block_num: root.block_num(), is_strong: false },
    );
    let b2 = child_of(
      &b1,
      102,
      QcClaim { block_num: root.block_num(), is_strong: false },
    );
    assert!(matches!(
      db.add(b2, false),
      Err(ForkDbError::UnlinkableBlock { .. })
    ));
  }

  #[test]
  fn branch_split_and_search() {
    let root = genesis_state();
    let weak = QcClaim { block_num: root.block_num(), is_strong: false };
    let mut db = ForkDb::new(root.clone());

    let a1 = child_of(&root, 101, weak);
    let a2 = child_of(&a1, 102, weak);
    let b1 = child_of(&root, 103, weak);
    let b2 = child_of(&b1, 104, weak);
    let b3 = child_of(&b2, 105, weak);
    for b in [&a1, &a2, &b1, &b2, &b3] {
      db.add(b.clone(), false).unwrap();
    }

    let (apply, unwind) =
      db.fetch_branch_from(b3.id(), a2.id()).unwrap();
    assert_eq!(
      apply.iter().map(|b| b.id()).collect::<Vec<_>>(),
      vec![b1.id(), b2.id(), b3.id()]
    );
    assert_eq!(
      unwind.iter().map(|b| b.id()).collect::<Vec<_>>(),
      vec![a2.id(), a1.id()]
    );

    let found = db
      .search_on_branch(b3.id(), b1.block_num(), false)
      .unwrap();
    assert_eq!(found.id(), b1.id());

    assert!(db.is_descendant_of(b1.id(), b3.id()));
    assert!(!db.is_descendant_of(a1.id(), b3.id()));

    let branch = db.fetch_branch(b3.id(), None);
    assert_eq!(branch.len(), 3);
    assert_eq!(branch[0].id(), b3.id());
  }

  #[test]
  fn advance_root_prunes_other_branches() {
    let root = genesis_state();
    let weak = QcClaim { block_num: root.block_num(), is_strong: false };
    let mut db = ForkDb::new(root.clone());

    let a1 = child_of(&root, 101, weak);
    let a2 = child_of(&a1, 102, weak);
    let b1 = child_of(&root, 103, weak);
    for b in [&a1, &a2, &b1] {
      db.add(b.clone(), false).unwrap();
    }

    db.advance_root(a1.id()).unwrap();
    assert_eq!(db.root().id(), a1.id());
    assert!(db.get_block(&b1.id(), false).is_none());
    assert!(db.get_block(&a2.id(), false).is_some());
    // the old root is gone; the new root is only reachable with
    // include_root
    assert!(db.get_block(&root.id(), true).is_none());
    assert!(db.get_block(&a1.id(), true).is_some());
    assert_eq!(db.head().id(), a2.id());
  }

  #[test]
  fn advance_root_to_unknown_block_fails() {
    let root = genesis_state();
    let mut db = ForkDb::new(root.clone());
    let stranger = child_of(
      &root,
      101,
      QcClaim { block_num: root.block_num(), is_strong: false },
    );
    assert!(matches!(
      db.advance_root(stranger.id()),
      Err(ForkDbError::UnknownBlock { .. })
    ));
  }

  #[test]
  fn remove_drops_subtree() {
    let root = genesis_state();
    let weak = QcClaim { block_num: root.block_num(), is_strong: false };
    let mut db = ForkDb::new(root.clone());

    let a1 = child_of(&root, 101, weak);
    let a2 = child_of(&a1, 102, weak);
    let a3 = child_of(&a2, 103, weak);
    for b in [&a1, &a2, &a3] {
      db.add(b.clone(), false).unwrap();
    }

    db.remove(a2.id()).unwrap();
    assert!(db.contains(&a1.id()));
    assert!(!db.contains(&a2.id()));
    assert!(!db.contains(&a3.id()));
    assert_eq!(db.head().id(), a1.id());
  }
}
