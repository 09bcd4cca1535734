//! End-to-end scenarios exercising production, sync, fork choice,
//! finality and the Legacy-to-Savanna transition.

use {
  super::*,
  crate::{
    chain::{
      error::{ForkDbError, ValidationError},
      BlockStatus,
      ChainError,
      HeaderState,
      InUse,
      StartBlockParams,
    },
    net::{ListenEndpoint, Net, NetConfig, NetEvent},
  },
  std::sync::Arc,
};

fn single_producer() -> (Keypair, Vec<(&'static str, Keypair)>) {
  let alpha = keypair(1);
  (alpha.clone(), vec![("alpha", alpha)])
}

fn producer_refs(
  producers: &[(&'static str, Keypair)],
) -> Vec<(&'static str, &Keypair)> {
  producers.iter().map(|(n, k)| (*n, k)).collect()
}

// ---- basic production and replay ----------------------------------

#[test]
fn produce_sync_and_restart() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);

  let blocks_dir = scratch_dir("replay-blocks");
  let mut config = test_config();
  config.blocks_dir = Some(blocks_dir.clone());

  let mut n1 =
    TestNode::with_config(genesis.clone(), &refs, vec![], config.clone());
  let mut produced = vec![];
  for _ in 0..12 {
    let bsp = n1.produce().unwrap();
    produced.push((*bsp.block).clone());
  }
  assert_eq!(n1.head_num(), 12);

  // a second node applies all twelve
  let mut n2 = TestNode::new(genesis.clone(), &refs, vec![]);
  for block in &produced {
    n2.feed(block.clone()).unwrap();
  }
  assert_eq!(n2.head_num(), 12);
  assert_eq!(
    n1.controller.integrity_hash(),
    n2.controller.integrity_hash()
  );

  // restart the first node from disk; the head is back without any
  // peer
  let head_id = n1.controller.head().id();
  let integrity = n1.controller.integrity_hash();
  drop(n1);
  let n1 = TestNode::with_config(genesis, &refs, vec![], config);
  assert_eq!(n1.head_num(), 12);
  assert_eq!(n1.controller.head().id(), head_id);
  assert_eq!(n1.controller.integrity_hash(), integrity);

  let _ = std::fs::remove_dir_all(blocks_dir);
}

#[test]
fn transactions_change_state_deterministically() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);

  let mut n1 = TestNode::new(genesis.clone(), &refs, vec![]);
  let mut n2 = TestNode::new(genesis, &refs, vec![]);

  let expiration = TimePoint::now() + Duration::from_secs(3600);
  let trx = n1.make_transaction("alice", b"payload", expiration);
  let bsp = n1.produce_at(n1.next_slot(), &[trx], vec![]).unwrap();
  assert_eq!(bsp.block.transactions.len(), 1);

  n2.feed((*bsp.block).clone()).unwrap();
  assert_eq!(
    n1.controller.integrity_hash(),
    n2.controller.integrity_hash()
  );
}

// ---- fork choice ---------------------------------------------------

#[test]
fn fork_switch_returns_abandoned_transactions() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let finalizers: Vec<_> = (1..=4).map(bls_keypair).collect();
  let genesis = savanna_genesis(&refs, &finalizers, 3);

  // node 1 holds three finalizers: its blocks gather strong quorums
  let mut n1 =
    TestNode::new(genesis.clone(), &refs, finalizers[..3].to_vec());
  // node 2 holds none: its branch carries no new certificates
  let mut n2 = TestNode::new(genesis, &refs, vec![]);

  // common prefix of 10 blocks
  let mut common = vec![];
  for _ in 0..10 {
    let bsp = n1.produce().unwrap();
    common.push((*bsp.block).clone());
  }
  for block in &common {
    n2.feed(block.clone()).unwrap();
  }
  assert_eq!(n2.head_num(), 10);

  // node 2 extends on its own with one transaction per block, at
  // sparser slots so its branch diverges
  let expiration = TimePoint::now() + Duration::from_secs(3600);
  for i in 0u8..3 {
    let slot = BlockTimestamp(n2.controller.head().timestamp().0 + 2);
    let trx = n2.make_transaction("bob", &[i], expiration);
    n2.produce_at(slot, &[trx], vec![]).unwrap();
  }
  assert_eq!(n2.head_num(), 13);

  // node 1 extends to 14 with strong certificates
  let mut n1_branch = vec![];
  for _ in 0..4 {
    let bsp = n1.produce().unwrap();
    n1_branch.push((*bsp.block).clone());
  }
  assert_eq!(n1.head_num(), 14);

  // feeding node 1's branch makes node 2 switch and hand back its
  // three abandoned transactions
  let mut returned = vec![];
  for block in n1_branch {
    returned.extend(n2.feed(block).unwrap());
  }
  assert_eq!(n2.head_num(), 14);
  assert_eq!(n2.controller.head().id(), n1.controller.head().id());
  assert_eq!(returned.len(), 3);
}

// ---- qc aggregation and the two-chain rule -------------------------

#[test]
fn strong_quorums_advance_finality_by_two_chain() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let finalizers: Vec<_> = (1..=4).map(bls_keypair).collect();
  let genesis = savanna_genesis(&refs, &finalizers, 3);

  let mut node = TestNode::new(genesis, &refs, finalizers[..3].to_vec());
  for _ in 0..6 {
    node.produce().unwrap();
  }
  let head = node.controller.head().clone();
  assert_eq!(head.block_num(), 6);

  // block 6 embeds a strong certificate claim on block 5
  let claim = head.latest_qc_claim().unwrap();
  assert_eq!(claim.block_num, 5);
  assert!(claim.is_strong);

  // aggregated votes on block 6 itself push the pending frontier to
  // block 4 under the two-chain rule
  let fork_db = node.controller.fork_db();
  let fork = fork_db.read().unwrap();
  let pending = fork.savanna().unwrap().pending_savanna_lib_num();
  assert_eq!(pending, Some(4));

  // and the fork database root has been advanced along with it
  assert_eq!(fork.active().root().block_num(), 4);
}

#[test]
fn blocks_raising_claims_must_carry_certificates() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let finalizers: Vec<_> = (1..=4).map(bls_keypair).collect();
  let genesis = savanna_genesis(&refs, &finalizers, 3);

  let mut n1 = TestNode::new(genesis.clone(), &refs, finalizers[..3].to_vec());
  let mut n2 = TestNode::new(genesis, &refs, vec![]);

  for _ in 0..4 {
    let bsp = n1.produce().unwrap();
    n2.feed((*bsp.block).clone()).unwrap();
  }

  // strip the certificate extension off a claim-raising block
  let bsp = n1.produce().unwrap();
  let mut stripped = (*bsp.block).clone();
  assert!(stripped.quorum_certificate_extension().is_some());
  stripped.block_extensions.clear();

  let err = n2.feed(stripped).unwrap_err();
  assert!(matches!(
    err,
    ChainError::Validation(ValidationError::Qc(_))
  ));
  assert!(err.close_peer());
}

// ---- dedup ---------------------------------------------------------

#[test]
fn duplicate_transactions_rejected_until_expiry() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);
  let mut node = TestNode::new(genesis, &refs, vec![]);

  let expiration = TimePoint::now() + Duration::from_secs(3600);
  let trx = node.make_transaction("carol", b"pay", expiration);

  let alpha = node.producer_keys.get(&"alpha".into()).unwrap().clone();
  node
    .controller
    .start_block(StartBlockParams {
      when: node.next_slot(),
      confirm_count: 0,
      feature_activations: vec![],
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline: TimePoint::now() + Duration::from_secs(10),
    })
    .unwrap();

  let deadline = TimePoint::now() + Duration::from_secs(10);
  let first = node.controller.push_transaction(trx.clone(), deadline).unwrap();
  assert!(first.except.is_none());

  // the same id again: rejected as a duplicate, block continues
  let second = node.controller.push_transaction(trx.clone(), deadline).unwrap();
  assert!(second.except.unwrap().contains("duplicate"));

  node.controller.assemble_and_complete_block(&alpha).unwrap();
  node.controller.commit_block().unwrap();
  node.controller.log_irreversible().unwrap();

  // still a duplicate in the next block
  let next = node.produce().unwrap();
  assert_eq!(next.block.transactions.len(), 0);
  node
    .controller
    .start_block(StartBlockParams {
      when: node.next_slot(),
      confirm_count: 0,
      feature_activations: vec![],
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline,
    })
    .unwrap();
  let third = node.controller.push_transaction(trx, deadline).unwrap();
  assert!(third.except.unwrap().contains("duplicate"));
  node.controller.abort_block();

  // an expired transaction is objectively rejected outright
  let stale = node.make_transaction("carol", b"stale", TimePoint::from_millis(1));
  node
    .controller
    .start_block(StartBlockParams {
      when: node.next_slot(),
      confirm_count: 0,
      feature_activations: vec![],
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline,
    })
    .unwrap();
  let trace = node.controller.push_transaction(stale, deadline).unwrap();
  assert!(trace.except.unwrap().contains("expired"));
  node.controller.abort_block();
}

// ---- validation failures -------------------------------------------

#[test]
fn tampered_receipts_fail_with_merkle_mismatch() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);

  let mut n1 = TestNode::new(genesis.clone(), &refs, vec![]);
  let mut n2 = TestNode::new(genesis, &refs, vec![]);

  let expiration = TimePoint::now() + Duration::from_secs(3600);
  let trx = n1.make_transaction("dave", b"x", expiration);
  let bsp = n1.produce_at(n1.next_slot(), &[trx], vec![]).unwrap();

  // drop the receipt but keep the header: the replayed transaction
  // merkle no longer matches
  let mut tampered = (*bsp.block).clone();
  tampered.transactions.clear();

  let head_before = n2.controller.head().id();
  let err = n2.feed(tampered.clone()).unwrap_err();
  match err {
    ChainError::Validation(ValidationError::MerkleMismatch {
      mroot, ..
    }) => assert_eq!(mroot, "transaction"),
    other => panic!("expected a merkle mismatch, got {other}"),
  }

  // the head never regressed and the bad subtree is gone
  assert_eq!(n2.controller.head().id(), head_before);
  let fork_db = n2.controller.fork_db();
  let fork = fork_db.read().unwrap();
  assert!(!fork.active().contains(&tampered.id()));
}

#[test]
fn start_block_rejected_while_pending_exists() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let mut node = TestNode::new(legacy_genesis(&refs), &refs, vec![]);

  fn params(node: &TestNode) -> StartBlockParams {
    StartBlockParams {
      when: node.controller.head().timestamp().next(),
      confirm_count: 0,
      feature_activations: vec![],
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline: TimePoint::now() + Duration::from_secs(10),
    }
  }
  let first = params(&node);
  node.controller.start_block(first).unwrap();
  let second = params(&node);
  assert!(matches!(
    node.controller.start_block(second),
    Err(ChainError::PendingBlockExists { .. })
  ));
  node.controller.abort_block();
}

#[test]
fn legacy_block_after_savanna_rejected() {
  let (alpha, producers) = single_producer();
  let refs = producer_refs(&producers);
  let finalizers: Vec<_> = (1..=4).map(bls_keypair).collect();
  let mut node =
    TestNode::new(savanna_genesis(&refs, &finalizers, 3), &refs, vec![]);
  node.produce().unwrap();

  // a correctly signed header with no finality extension
  use ed25519_dalek::Signer;
  let head = node.controller.head().clone();
  let header = crate::chain::BlockHeader {
    timestamp: head.timestamp().next(),
    producer: "alpha".into(),
    confirmed: 0,
    previous: head.id(),
    transaction_mroot: Default::default(),
    action_mroot: Default::default(),
    schedule_version: 0,
    new_producers: None,
    header_extensions: vec![],
  };
  let block = crate::chain::SignedBlock {
    signed_header: crate::chain::header::SignedBlockHeader {
      producer_signature: alpha.sign(header.digest().as_ref()),
      header,
    },
    transactions: vec![],
    block_extensions: vec![],
  };
  assert!(matches!(
    node.feed(block),
    Err(ChainError::Validation(ValidationError::LegacyAfterSavanna))
  ));
}

#[test]
fn unlinkable_blocks_are_reported_as_such() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);
  let mut n1 = TestNode::new(genesis.clone(), &refs, vec![]);
  let mut n2 = TestNode::new(genesis, &refs, vec![]);

  n1.produce().unwrap();
  let orphan = n1.produce().unwrap();
  // block 2 without block 1
  assert!(matches!(
    n2.feed((*orphan.block).clone()),
    Err(ChainError::ForkDb(ForkDbError::UnlinkableBlock { .. }))
  ));
}

// ---- the legacy to savanna transition ------------------------------

#[test]
fn live_transition_to_savanna() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let finalizers: Vec<_> = (1..=4).map(bls_keypair).collect();
  let policy = finalizer_policy(&finalizers, 3);
  let genesis = legacy_genesis(&refs);

  let mut node =
    TestNode::new(genesis.clone(), &refs, finalizers[..3].to_vec());
  let mut observer = TestNode::new(genesis, &refs, vec![]);

  // a few plain legacy blocks first
  let mut blocks = vec![];
  for _ in 0..3 {
    blocks.push((*node.produce().unwrap().block).clone());
  }
  {
    let fork_db = node.controller.fork_db();
    assert_eq!(fork_db.read().unwrap().in_use(), InUse::Legacy);
  }

  // the Savanna Genesis block: activates the feature and proposes the
  // generation-1 policy
  let slot = node.next_slot();
  let alpha = node.producer_keys.get(&"alpha".into()).unwrap().clone();
  node
    .controller
    .start_block(StartBlockParams {
      when: slot,
      confirm_count: 0,
      feature_activations: vec![*crate::chain::features::SAVANNA_FEATURE],
      status: BlockStatus::Incomplete,
      producer_block_id: None,
      deadline: TimePoint::now() + Duration::from_secs(10),
    })
    .unwrap();
  node.controller.propose_finalizer_policy(policy.clone()).unwrap();
  node.controller.assemble_and_complete_block(&alpha).unwrap();
  let genesis_bsp = node.controller.commit_block().unwrap();
  node.controller.log_irreversible().unwrap();
  blocks.push((*genesis_bsp.block).clone());

  assert!(genesis_bsp.block.header().is_savanna());
  let genesis_num = genesis_bsp.block_num();

  // transition completes once the genesis block becomes irreversible;
  // with a single legacy producer that is the very next block
  blocks.push((*node.produce().unwrap().block).clone());
  {
    let fork_db = node.controller.fork_db();
    assert_eq!(fork_db.read().unwrap().in_use(), InUse::Savanna);
  }
  assert!(matches!(
    node.controller.head().header_state,
    HeaderState::Savanna(_)
  ));

  // proper savanna blocks with certificates follow
  for _ in 0..4 {
    blocks.push((*node.produce().unwrap().block).clone());
  }
  let head = node.controller.head().clone();
  assert!(head.header_state.is_proper_savanna());
  let claim = head.latest_qc_claim().unwrap();
  assert!(claim.is_strong);
  assert!(claim.block_num > genesis_num);

  // an observer without finalizer keys follows the same transition
  for block in &blocks {
    observer.feed(block.clone()).unwrap();
  }
  assert_eq!(observer.controller.head().id(), head.id());
  {
    let fork_db = observer.controller.fork_db();
    assert_eq!(fork_db.read().unwrap().in_use(), InUse::Savanna);
  }
  assert_eq!(
    observer.controller.integrity_hash(),
    node.controller.integrity_hash()
  );
}

// ---- snapshots -----------------------------------------------------

#[test]
fn snapshot_reproduces_integrity_hash() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let mut node = TestNode::new(legacy_genesis(&refs), &refs, vec![]);

  let expiration = TimePoint::now() + Duration::from_secs(3600);
  for i in 0u8..5 {
    let trx = node.make_transaction("erin", &[i], expiration);
    node.produce_at(node.next_slot(), &[trx], vec![]).unwrap();
  }

  let dir = scratch_dir("snapshot");
  let path = dir.join("head.snapshot");
  node.controller.write_snapshot(&path).unwrap();

  let restored = crate::chain::Controller::from_snapshot(
    &path,
    test_config(),
    Arc::new(KvExecutor),
    vec![],
  )
  .unwrap();
  assert_eq!(restored.head().id(), node.controller.head().id());
  assert_eq!(restored.integrity_hash(), node.controller.integrity_hash());
  let _ = std::fs::remove_dir_all(dir);
}

// ---- networked sync ------------------------------------------------

fn free_port() -> u16 {
  std::net::TcpListener::bind("127.0.0.1:0")
    .expect("bind probe")
    .local_addr()
    .expect("local addr")
    .port()
}

/// Drives a node's network events until its head reaches `target` or
/// the timeout passes. Returns the controller for assertions.
async fn drive_until(
  mut node: TestNode,
  net: Arc<Net>,
  mut events: tokio::sync::mpsc::UnboundedReceiver<NetEvent>,
  target: u32,
  timeout: Duration,
) -> TestNode {
  let deadline = tokio::time::Instant::now() + timeout;
  while node.head_num() < target {
    let event = tokio::select! {
      event = events.recv() => event,
      _ = tokio::time::sleep_until(deadline) => break,
    };
    let Some(event) = event else { break };
    if let NetEvent::Block { peer, block } = event {
      let id = block.id();
      match node.controller.accept_block(*block) {
        Ok(_) => {
          let _ = node.apply_all();
          net.block_accepted(peer, id, node.head_num());
        }
        Err(e) => {
          // duplicates are normal during renegotiation
          tracing::debug!("accept failed during sync test: {e}");
        }
      }
    }
  }
  node
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_sync_over_tcp() {
  let (_, producers) = single_producer();
  let refs = producer_refs(&producers);
  let genesis = legacy_genesis(&refs);

  let mut n1 = TestNode::new(genesis.clone(), &refs, vec![]);
  let expiration = TimePoint::now() + Duration::from_secs(3600);
  for i in 0u8..12 {
    let trx = n1.make_transaction("frank", &[i; 64], expiration);
    n1.produce_at(n1.next_slot(), &[trx], vec![]).unwrap();
  }
  assert_eq!(n1.head_num(), 12);

  let port = free_port();
  let listen = ListenEndpoint {
    addr: format!("127.0.0.1:{port}"),
    kind: crate::net::EndpointKind::Both,
    // slow enough that throttling engages at least once
    block_sync_rate_limit: Some(2_000),
  };

  let (net1, _events1) = Net::new(
    NetConfig {
      listen_endpoints: vec![listen],
      ..NetConfig::default()
    },
    n1.controller.chain_id(),
    n1.controller.fork_db(),
    n1.controller.block_log().clone(),
  );
  net1.set_applied_head(n1.head_num());
  net1.start();
  tokio::time::sleep(Duration::from_millis(100)).await;

  let n2 = TestNode::new(genesis, &refs, vec![]);
  let (net2, events2) = Net::new(
    NetConfig {
      peers: vec![format!("127.0.0.1:{port}")],
      ..NetConfig::default()
    },
    n2.controller.chain_id(),
    n2.controller.fork_db(),
    n2.controller.block_log().clone(),
  );
  net2.start();

  // watch for throttling on the serving side while the sync runs
  let throttle_observer = {
    let net1 = net1.clone();
    tokio::spawn(async move {
      let mut seen = false;
      for _ in 0..600 {
        if net1.is_block_sync_throttling() {
          seen = true;
          break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
      }
      seen
    })
  };

  let n2 =
    drive_until(n2, net2.clone(), events2, 12, Duration::from_secs(30)).await;
  assert_eq!(n2.head_num(), 12);
  assert_eq!(
    n2.controller.integrity_hash(),
    n1.controller.integrity_hash()
  );
  assert!(throttle_observer.await.unwrap());

  net1.shutdown();
  net2.shutdown();
}
