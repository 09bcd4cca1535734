use {
  clap::Parser,
  std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
  },
  tokio::sync::broadcast,
  tracing::{debug, error, info, warn, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
  veldt::{
    chain::{
      ApplyResult,
      BlockStatus,
      ChainEvent,
      Controller,
      KvExecutor,
      StartBlockParams,
      TransactionMetadata,
      VoteProcessor,
    },
    cli::CliOpts,
    net::{Net, NetEvent},
    primitives::{
      AccountName,
      BlockTimestamp,
      TimePoint,
      TransactionId,
      BLOCK_INTERVAL_MS,
    },
    storage::{load_fork_db, save_fork_db},
  },
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn print_essentials(opts: &CliOpts) -> anyhow::Result<()> {
  info!("Starting veldt node");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  let genesis = opts.genesis()?;
  info!("Chain: {} ({})", genesis.name, genesis.chain_id());
  info!("Listen endpoints: {:?}", opts.p2p_listen_endpoint);
  info!("Peers: {:?}", opts.p2p_peer_address);
  if let Some(producer) = &opts.producer_name {
    info!("Producing as: {producer}");
  }
  info!("Finalizer keys: {}", opts.finalizer_key.len());
  Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  print_essentials(&opts)?;

  let genesis = opts.genesis()?;
  let mut controller = Controller::new(
    genesis,
    opts.chain_config()?,
    Arc::new(KvExecutor),
    opts.finalizer_key.clone(),
  )?;

  if opts.integrity_hash_on_start {
    info!("state integrity hash: {}", controller.integrity_hash());
  }

  let vote_processor = Arc::new(VoteProcessor::new(
    controller.fork_db(),
    controller.event_sender(),
    opts.vote_thread_pool_size,
  ));

  let (net, mut net_events) = Net::new(
    opts.net_config()?,
    controller.chain_id(),
    controller.fork_db(),
    controller.block_log().clone(),
  );
  net.start();

  // blocks saved by the previous clean shutdown re-enter the fork
  // database by re-validation
  let fork_file = opts
    .state_dir
    .clone()
    .map(|dir| dir.join("fork_db.dat"));
  if let Some(path) = &fork_file {
    let mut trx_queue = VecDeque::new();
    for block in load_fork_db(path) {
      if let Err(e) = controller.accept_block(block) {
        warn!("stale fork database entry dropped: {e}");
        break;
      }
      drain_apply(&mut controller, &mut trx_queue)?;
    }
  }
  net.set_applied_head(controller.head().block_num());
  info!("chain head at block {}", controller.head().block_num());

  let mut chain_events = controller.subscribe();
  let producer_key = opts.producer_key.clone();
  let producer_name = opts.producer_name.clone().map(AccountName::new);

  // producers participating in endpoint gossip re-announce
  // periodically so records survive peer churn
  if opts.p2p_bp_gossip_endpoint {
    if let (Some(key), Some(name)) = (&producer_key, &producer_name) {
      let net = net.clone();
      let key = key.clone();
      let name = name.clone();
      tokio::spawn(async move {
        loop {
          net.gossip_own_bp_endpoint(name.clone(), &key);
          tokio::time::sleep(Duration::from_secs(120)).await;
        }
      });
    }
  }

  // transactions admitted from peers, waiting for our next block;
  // fork switches push their transactions back in here as well
  let mut trx_queue: VecDeque<Arc<TransactionMetadata>> = VecDeque::new();
  let mut last_produced_slot: u32 = 0;

  let mut slot_timer =
    tokio::time::interval(Duration::from_millis(BLOCK_INTERVAL_MS / 4));

  loop {
    tokio::select! {
      _ = slot_timer.tick() => {
        let (Some(key), Some(name)) = (&producer_key, &producer_name) else {
          continue;
        };
        let slot = BlockTimestamp::from_time_point(TimePoint::now());
        if slot.slot() <= last_produced_slot {
          continue;
        }
        let schedule =
          controller.head().header_state.producer_schedule().clone();
        if &schedule.producer_for(slot).producer_name != name {
          continue;
        }
        last_produced_slot = slot.slot();
        if let Err(e) =
          produce_block(&mut controller, &net, key, slot, &mut trx_queue)
        {
          error!("failed to produce block at slot {}: {e}", slot.slot());
          for meta in controller.abort_block() {
            trx_queue.push_back(meta);
          }
        }
      }

      event = net_events.recv() => {
        let Some(event) = event else { break };
        if let Err(e) = handle_net_event(
          &mut controller,
          &net,
          &vote_processor,
          event,
          &mut trx_queue,
        ) {
          error!("net event handling failed: {e}");
        }
      }

      event = chain_events.recv() => {
        match event {
          Ok(event) => handle_chain_event(&net, event),
          Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("chain event stream lagged by {n}");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }

      _ = tokio::signal::ctrl_c() => {
        info!("shutting down");
        break;
      }
    }
  }

  controller.abort_block();
  if let Some(path) = &fork_file {
    let fork_db = controller.fork_db();
    let fork = fork_db.read().expect("fork db lock");
    if let Err(e) = save_fork_db(path, &fork) {
      error!("failed to persist fork database: {e}");
    }
  }
  if opts.integrity_hash_on_stop {
    info!("state integrity hash: {}", controller.integrity_hash());
  }
  net.shutdown();
  Ok(())
}

/// Runs the apply loop until the chain head reaches the best known
/// block, requeueing transactions from abandoned forks.
fn drain_apply(
  controller: &mut Controller,
  trx_queue: &mut VecDeque<Arc<TransactionMetadata>>,
) -> anyhow::Result<()> {
  let lookup = |_id: &TransactionId| None;
  loop {
    let mut forked = vec![];
    let result = controller.apply_blocks(
      &mut |metas| forked.extend(metas),
      &lookup,
    );
    for meta in forked {
      trx_queue.push_back(meta);
    }
    match result {
      Ok(ApplyResult::Incomplete) => continue,
      Ok(_) => return Ok(()),
      Err(e) => return Err(e.into()),
    }
  }
}

fn produce_block(
  controller: &mut Controller,
  net: &Arc<Net>,
  key: &veldt::primitives::Keypair,
  slot: BlockTimestamp,
  trx_queue: &mut VecDeque<Arc<TransactionMetadata>>,
) -> anyhow::Result<()> {
  if controller.is_building() {
    for meta in controller.abort_block() {
      trx_queue.push_front(meta);
    }
  }

  let deadline = TimePoint::now() + Duration::from_millis(BLOCK_INTERVAL_MS / 2);
  controller.start_block(StartBlockParams {
    when: slot,
    confirm_count: 0,
    feature_activations: vec![],
    status: BlockStatus::Incomplete,
    producer_block_id: None,
    deadline,
  })?;

  while let Some(meta) = trx_queue.pop_front() {
    if TimePoint::now() > deadline {
      trx_queue.push_front(meta);
      break;
    }
    match controller.push_transaction(meta.clone(), deadline) {
      Ok(trace) => {
        if let Some(except) = trace.except {
          debug!("transaction {} dropped: {except}", meta.id);
        }
      }
      Err(e) => {
        // an interrupt aborts the whole block
        trx_queue.push_front(meta);
        return Err(e.into());
      }
    }
  }

  controller.assemble_and_complete_block(key)?;
  let bsp = controller.commit_block()?;
  info!(
    "produced block {} at slot {} with {} transaction(s)",
    bsp.block_num(),
    slot.slot(),
    bsp.block.transactions.len()
  );
  net.set_applied_head(bsp.block_num());
  net.broadcast_block(&bsp.block, true);
  controller.log_irreversible()?;
  Ok(())
}

fn handle_net_event(
  controller: &mut Controller,
  net: &Arc<Net>,
  vote_processor: &Arc<VoteProcessor>,
  event: NetEvent,
  trx_queue: &mut VecDeque<Arc<TransactionMetadata>>,
) -> anyhow::Result<()> {
  match event {
    NetEvent::Block { peer, block } => {
      let id = block.id();
      match controller.accept_block(*block) {
        Ok((_result, Some(bsp))) => {
          vote_processor.notify_block(&bsp);
          // relay goes out as soon as the header validates
          net.broadcast_block(&bsp.block, false);
          if let Err(e) = drain_apply(controller, trx_queue) {
            warn!("failed to apply block {id}: {e}");
            net.block_rejected(peer, true);
            return Ok(());
          }
          net.block_accepted(peer, id, controller.head().block_num());
        }
        Ok((_, None)) => {
          // duplicate at or below the root
          net.block_accepted(peer, id, controller.head().block_num());
        }
        Err(e) => {
          use veldt::chain::ChainError;
          match &e {
            ChainError::ForkDb(
              veldt::chain::error::ForkDbError::UnlinkableBlock { .. },
            ) => {
              debug!("unlinkable block {id} from peer {peer}");
              // renegotiate; the peer likely knows a branch we lack
              net.send_handshakes();
            }
            _ => {
              warn!("rejected block {id}: {e}");
              net.block_rejected(peer, e.close_peer());
            }
          }
        }
      }
    }
    NetEvent::Transaction { peer, trx } => {
      match controller.recover_keys_pooled(*trx.clone()) {
        Ok(meta) => {
          net.broadcast_transaction(&trx);
          trx_queue.push_back(meta);
        }
        Err(e) => {
          debug!("dropping bad transaction from peer {peer}: {e}");
        }
      }
    }
    NetEvent::Vote { peer, vote } => {
      use veldt::chain::VoteOutcome;
      let outcome = vote_processor.process_vote(&vote);
      match outcome {
        VoteOutcome::BadSignature => {
          warn!("bad vote signature from peer {peer}");
          net.close_peer(peer, veldt::net::GoAwayReason::BadTransaction);
        }
        VoteOutcome::Accepted | VoteOutcome::Quorum => {
          net.broadcast_vote(&vote);
        }
        _ => {}
      }
    }
  }
  Ok(())
}

fn handle_chain_event(net: &Arc<Net>, event: ChainEvent) {
  match event {
    ChainEvent::VotedBlock(vote) => net.broadcast_vote(&vote),
    ChainEvent::IrreversibleBlock(bsp) => {
      net.dispatch.prune_blocks(bsp.block_num());
    }
    ChainEvent::AcceptedBlock(bsp) => {
      net.set_applied_head(bsp.block_num());
    }
    _ => {}
  }
}
