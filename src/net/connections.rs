//! Connection lifecycle and message handling.
//!
//! Owns the peer table, the listeners, the outbound dial loop with
//! backoff, the periodic monitors, and the broadcast policies. Each
//! accepted socket gets a reader task, a writer task and a heartbeat
//! task; everything a peer sends funnels through `handle_message` on
//! its reader task.

use {
  super::{
    connection::{Peer, PeerSyncState, QueueKind},
    dispatch::{DispatchManager, TRX_NOTICE_SIZE_THRESHOLD},
    sync::{
      ChainInfo,
      HandshakeVerdict,
      PeerSummary,
      SyncManager,
      SyncProgress,
    },
    wire::{
      BlockNackMessage,
      BlockNoticeMessage,
      GoAwayMessage,
      GoAwayReason,
      GossipBpPeersMessage,
      HandshakeMessage,
      IdListMode,
      MessageCodec,
      NetMessage,
      NoticeMessage,
      OrderedIds,
      ProtoVersion,
      RequestMessage,
      SignedBpPeer,
      SyncRequestMessage,
      TransactionNoticeMessage,
    },
  },
  crate::{
    chain::{ForkDatabase, PackedTransaction, SignedBlock, VoteMessage},
    primitives::{
      AccountName,
      BlockId,
      Digest,
      Keypair,
      Pubkey,
      TimePoint,
    },
    storage::BlockLog,
  },
  dashmap::DashMap,
  futures::StreamExt,
  std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
      atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
      Arc,
      Mutex,
      RwLock,
    },
    time::{Duration, Instant},
  },
  tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
  },
  tokio_util::codec::FramedRead,
  tracing::{debug, error, info, trace, warn},
};

/// Two consecutive nacks switch a peer from full blocks to notices.
pub const CONSECUTIVE_BLOCK_NACKS_THRESHOLD: u32 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllowedConnection {
  Any,
  Producers,
  Specified,
  NoneAtAll,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointKind {
  Both,
  TransactionsOnly,
  BlocksOnly,
}

/// A parsed `host:port[:trx|:blk][:rate]` listen endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenEndpoint {
  pub addr: String,
  pub kind: EndpointKind,
  pub block_sync_rate_limit: Option<u64>,
}

impl ListenEndpoint {
  /// `host:port`, `host:port:trx`, `host:port:blk`,
  /// `host:port:blk:500KB/s`.
  pub fn parse(spec: &str) -> Result<Self, String> {
    let mut parts = spec.split(':');
    let host = parts.next().ok_or("missing host")?.to_owned();
    let port = parts.next().ok_or("missing port")?;
    port.parse::<u16>().map_err(|_| format!("bad port {port}"))?;

    let mut kind = EndpointKind::Both;
    let mut rate = None;
    for part in parts {
      match part {
        "trx" => kind = EndpointKind::TransactionsOnly,
        "blk" => kind = EndpointKind::BlocksOnly,
        other => rate = Some(parse_rate(other)?),
      }
    }
    Ok(Self { addr: format!("{host}:{port}"), kind, block_sync_rate_limit: rate })
  }
}

/// Parses `500B/s`, `1KB/s`, `2MB/s`, `1GB/s` into bytes per second.
fn parse_rate(spec: &str) -> Result<u64, String> {
  let spec = spec
    .strip_suffix("/s")
    .ok_or_else(|| format!("rate {spec} must end in /s"))?;
  let (digits, multiplier) = if let Some(d) = spec.strip_suffix("GB") {
    (d, 1_000_000_000)
  } else if let Some(d) = spec.strip_suffix("MB") {
    (d, 1_000_000)
  } else if let Some(d) = spec.strip_suffix("KB") {
    (d, 1_000)
  } else if let Some(d) = spec.strip_suffix('B') {
    (d, 1)
  } else {
    return Err(format!("rate {spec} has no unit"));
  };
  let value: u64 =
    digits.parse().map_err(|_| format!("bad rate value {digits}"))?;
  Ok(value * multiplier)
}

#[derive(Clone, Debug)]
pub struct NetConfig {
  pub listen_endpoints: Vec<ListenEndpoint>,
  /// Externally visible address advertised in handshakes.
  pub p2p_server_address: Option<String>,
  pub peers: Vec<String>,
  pub agent_name: String,
  pub allowed_connection: AllowedConnection,
  pub peer_keys: Vec<Pubkey>,
  pub peer_private_key: Option<Keypair>,
  pub max_clients: usize,
  pub max_nodes_per_host: usize,
  pub accept_transactions: bool,
  pub disable_block_nack: bool,
  pub auto_bp_peers: Vec<(AccountName, String)>,
  pub bp_gossip: bool,
  pub connector_period: Duration,
  pub dedup_cache_expire: Duration,
  pub sync_fetch_span: u32,
  pub sync_peer_limit: usize,
  pub keepalive_interval: Duration,
  pub resp_expected: Duration,
  pub max_write_queue_size: usize,
  pub irreversible_mode: bool,
}

impl Default for NetConfig {
  fn default() -> Self {
    Self {
      listen_endpoints: vec![],
      p2p_server_address: None,
      peers: vec![],
      agent_name: "veldt agent".into(),
      allowed_connection: AllowedConnection::Any,
      peer_keys: vec![],
      peer_private_key: None,
      max_clients: 25,
      max_nodes_per_host: 1,
      accept_transactions: true,
      disable_block_nack: false,
      auto_bp_peers: vec![],
      bp_gossip: false,
      connector_period: Duration::from_secs(30),
      dedup_cache_expire: Duration::from_secs(10),
      sync_fetch_span: 1000,
      sync_peer_limit: 3,
      keepalive_interval: Duration::from_millis(10_000),
      resp_expected: Duration::from_secs(5),
      max_write_queue_size: 64 * 1024 * 1024,
      irreversible_mode: false,
    }
  }
}

/// What the network layer hands to the node driver.
#[derive(Debug)]
pub enum NetEvent {
  Block { peer: u64, block: Box<SignedBlock> },
  Transaction { peer: u64, trx: Box<PackedTransaction> },
  Vote { peer: u64, vote: VoteMessage },
}

struct DialState {
  failures: u32,
  last_attempt: Option<Instant>,
  fatal: bool,
}

pub struct Net {
  config: NetConfig,
  chain_id: Digest,
  node_id: Digest,
  peers: DashMap<u64, Arc<Peer>>,
  next_peer_id: AtomicU64,
  pub sync: SyncManager,
  pub dispatch: DispatchManager,
  fork_db: Arc<RwLock<ForkDatabase>>,
  block_log: BlockLog,
  applied_head: AtomicU32,
  events_tx: mpsc::UnboundedSender<NetEvent>,
  /// Producer endpoints learned from configuration and gossip.
  bp_addresses: Mutex<HashMap<AccountName, String>>,
  dial_states: Mutex<HashMap<String, DialState>>,
  shutting_down: AtomicBool,
}

impl Net {
  pub fn new(
    config: NetConfig,
    chain_id: Digest,
    fork_db: Arc<RwLock<ForkDatabase>>,
    block_log: BlockLog,
  ) -> (Arc<Self>, mpsc::UnboundedReceiver<NetEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let node_id = Digest::hash(rand::random::<[u8; 32]>());
    let sync = SyncManager::new(
      config.sync_fetch_span,
      config.sync_peer_limit,
      config.resp_expected,
      config.irreversible_mode,
    );
    let dispatch = DispatchManager::new(config.dedup_cache_expire);
    let bp_addresses = config
      .auto_bp_peers
      .iter()
      .cloned()
      .collect::<HashMap<_, _>>();
    let net = Arc::new(Self {
      config,
      chain_id,
      node_id,
      peers: DashMap::new(),
      next_peer_id: AtomicU64::new(1),
      sync,
      dispatch,
      fork_db,
      block_log,
      applied_head: AtomicU32::new(0),
      events_tx,
      bp_addresses: Mutex::new(bp_addresses),
      dial_states: Mutex::new(HashMap::new()),
      shutting_down: AtomicBool::new(false),
    });
    (net, events_rx)
  }

  pub fn node_id(&self) -> Digest {
    self.node_id
  }

  pub fn peer_count(&self) -> usize {
    self.peers.len()
  }

  /// True while any peer's block-sync stream is being rate limited;
  /// surfaced for operational metrics.
  pub fn is_block_sync_throttling(&self) -> bool {
    self
      .peers
      .iter()
      .any(|p| p.block_sync_throttling.load(Ordering::Relaxed))
  }

  pub fn set_applied_head(&self, num: u32) {
    self.applied_head.store(num, Ordering::Relaxed);
  }

  pub fn chain_info(&self) -> ChainInfo {
    let fork = self.fork_db.read().expect("fork db lock");
    let active = fork.active();
    ChainInfo {
      root_num: active.root().block_num(),
      root_id: active.root().id(),
      head_num: active.head().block_num(),
      head_id: active.head().id(),
      applied_head_num: self.applied_head.load(Ordering::Relaxed),
    }
  }

  pub fn shutdown(&self) {
    self.shutting_down.store(true, Ordering::Relaxed);
    for peer in self.peers.iter() {
      peer.close(GoAwayReason::NoReason);
    }
  }

  /// Starts listeners, the dial loop and the periodic monitors.
  pub fn start(self: &Arc<Self>) {
    for endpoint in self.config.listen_endpoints.clone() {
      let net = self.clone();
      tokio::spawn(async move {
        if let Err(e) = net.listen(endpoint.clone()).await {
          error!("listener on {} failed: {e}", endpoint.addr);
        }
      });
    }

    // outbound connector with backoff
    let net = self.clone();
    tokio::spawn(async move {
      loop {
        if net.shutting_down.load(Ordering::Relaxed) {
          return;
        }
        net.connect_configured_peers();
        tokio::time::sleep(net.config.connector_period.min(Duration::from_secs(2)))
          .await;
      }
    });

    // dedup cache expiry
    let net = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(net.config.dedup_cache_expire / 2).await;
        net.dispatch.expire();
      }
    });

    // sync response timeout and connection health monitor
    let net = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if net.shutting_down.load(Ordering::Relaxed) {
          return;
        }
        if net.sync.request_timed_out() {
          let our = net.chain_info();
          net.sync.reassign(&our);
          net.request_next_sync_chunk();
        }
        net.peers.retain(|_, peer| !peer.is_closed());
      }
    });

    // connection metrics monitor
    let net = self.clone();
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        if net.shutting_down.load(Ordering::Relaxed) {
          return;
        }
        debug!(
          "{} peer connection(s), {} dedup entr(ies), sync state {:?}",
          net.peer_count(),
          net.dispatch.txn_count(),
          net.sync.state()
        );
      }
    });
  }

  async fn listen(self: Arc<Self>, endpoint: ListenEndpoint) -> std::io::Result<()> {
    let listener = TcpListener::bind(&endpoint.addr).await?;
    info!("p2p listening on {}", endpoint.addr);
    loop {
      let (socket, remote) = listener.accept().await?;
      if self.shutting_down.load(Ordering::Relaxed) {
        return Ok(());
      }
      if self.peer_count() >= self.config.max_clients {
        warn!("max_clients reached; dropping connection from {remote}");
        continue;
      }
      if self.count_from_host(remote.ip()) >= self.config.max_nodes_per_host {
        warn!("too many connections from {}; dropping", remote.ip());
        continue;
      }
      if self.config.allowed_connection == AllowedConnection::NoneAtAll {
        continue;
      }
      self.start_peer(socket, remote.to_string(), false, &endpoint);
    }
  }

  fn count_from_host(&self, ip: IpAddr) -> usize {
    self
      .peers
      .iter()
      .filter(|p| {
        !p.outbound
          && p.peer_address
            .parse::<std::net::SocketAddr>()
            .map(|a| a.ip() == ip)
            .unwrap_or(false)
      })
      .count()
  }

  fn connect_configured_peers(self: &Arc<Self>) {
    let mut addresses: Vec<String> = self.config.peers.clone();
    // auto-BP peering adds endpoints of producers currently in the
    // active schedule
    for (producer, address) in self.active_bp_endpoints() {
      trace!("auto-bp peering wants {producer} at {address}");
      addresses.push(address);
    }

    for address in addresses {
      if self.is_connected_to(&address) {
        continue;
      }
      let should_dial = {
        let mut dials = self.dial_states.lock().expect("dial lock");
        let state = dials.entry(address.clone()).or_insert(DialState {
          failures: 0,
          last_attempt: None,
          fatal: false,
        });
        if state.fatal {
          false
        } else {
          // immediate-close counting stretches the retry period
          let backoff = self.config.connector_period
            * (state.failures.min(10) + 1);
          let due = state
            .last_attempt
            .map(|at| at.elapsed() >= backoff)
            .unwrap_or(true);
          if due {
            state.last_attempt = Some(Instant::now());
          }
          due
        }
      };
      if should_dial {
        let net = self.clone();
        tokio::spawn(async move {
          net.dial(address).await;
        });
      }
    }
  }

  fn is_connected_to(&self, address: &str) -> bool {
    self
      .peers
      .iter()
      .any(|p| p.peer_address == address && !p.is_closed())
  }

  fn active_bp_endpoints(&self) -> Vec<(AccountName, String)> {
    if self.config.auto_bp_peers.is_empty() && !self.config.bp_gossip {
      return vec![];
    }
    let schedule = {
      let fork = self.fork_db.read().expect("fork db lock");
      fork.active().head().header_state.producer_schedule().clone()
    };
    let book = self.bp_addresses.lock().expect("bp lock");
    schedule
      .producers
      .iter()
      .filter_map(|p| {
        book
          .get(&p.producer_name)
          .map(|addr| (p.producer_name.clone(), addr.clone()))
      })
      .collect()
  }

  pub async fn dial(self: Arc<Self>, address: String) {
    debug!("dialing {address}");
    match TcpStream::connect(&address).await {
      Ok(socket) => {
        let endpoint = ListenEndpoint {
          addr: address.clone(),
          kind: EndpointKind::Both,
          block_sync_rate_limit: None,
        };
        self.start_peer(socket, address, true, &endpoint);
      }
      Err(e) => {
        debug!("failed to connect to {address}: {e}");
        let mut dials = self.dial_states.lock().expect("dial lock");
        if let Some(state) = dials.get_mut(&address) {
          state.failures += 1;
        }
      }
    }
  }

  fn start_peer(
    self: &Arc<Self>,
    socket: TcpStream,
    address: String,
    outbound: bool,
    endpoint: &ListenEndpoint,
  ) {
    let _ = socket.set_nodelay(true);
    let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
    let peer = Peer::new(
      id,
      address,
      outbound,
      self.config.max_write_queue_size,
      endpoint.block_sync_rate_limit,
    );
    match endpoint.kind {
      EndpointKind::TransactionsOnly => {
        peer.accepts_blocks.store(false, Ordering::Relaxed)
      }
      EndpointKind::BlocksOnly => {
        peer.accepts_transactions.store(false, Ordering::Relaxed)
      }
      EndpointKind::Both => {}
    }
    self.peers.insert(id, peer.clone());

    let (read_half, write_half) = socket.into_split();
    tokio::spawn(peer.clone().run_writer(write_half));

    // the heartbeat task: ping, staleness close, re-handshake on
    // block silence
    let net = self.clone();
    let hb_peer = peer.clone();
    tokio::spawn(async move {
      let interval = net.config.keepalive_interval;
      let mut closed = hb_peer.closed_watch();
      loop {
        tokio::select! {
          _ = tokio::time::sleep(interval) => {}
          _ = closed.changed() => return,
        }
        if hb_peer.is_closed() {
          return;
        }
        let now = TimePoint::now().as_nanos();
        let silent =
          now - hb_peer.last_received_ns.load(Ordering::Relaxed);
        if silent > 2 * interval.as_nanos() as i64 {
          warn!("no message from {} within {:?}; closing", hb_peer.peer_address, interval * 2);
          hb_peer.close(GoAwayReason::BenignOther);
          return;
        }
        let block_silent =
          now - hb_peer.last_block_received_ns.load(Ordering::Relaxed);
        if block_silent > interval.as_nanos() as i64 {
          // renegotiate sync state when blocks stop flowing
          net.send_handshake_to(&hb_peer);
        }
        hb_peer.send_time_ping();
      }
    });

    // the reader task
    let net = self.clone();
    let rd_peer = peer.clone();
    tokio::spawn(async move {
      let mut framed = FramedRead::new(read_half, MessageCodec::default());
      let mut closed = rd_peer.closed_watch();
      loop {
        let frame = tokio::select! {
          frame = framed.next() => frame,
          _ = closed.changed() => break,
        };
        match frame {
          Some(Ok(msg)) => {
            rd_peer.record_received();
            net.handle_message(&rd_peer, msg).await;
          }
          Some(Err(e)) => {
            warn!("framing error from {}: {e}", rd_peer.peer_address);
            net.send_go_away(&rd_peer, GoAwayReason::BenignOther);
            break;
          }
          None => {
            debug!("{} closed the connection", rd_peer.peer_address);
            break;
          }
        }
      }
      rd_peer.close(GoAwayReason::NoReason);
      net.peers.remove(&rd_peer.id);
      if net.sync.source() == Some(rd_peer.id) {
        let our = net.chain_info();
        net.sync.reassign(&our);
        net.request_next_sync_chunk();
      }
    });

    self.send_handshake_to(&peer);
  }

  pub fn send_handshake_to(&self, peer: &Arc<Peer>) {
    let our = self.chain_info();
    peer.send_handshake(
      self.chain_id,
      self.node_id,
      self
        .config
        .p2p_server_address
        .clone()
        .unwrap_or_else(|| "unknown".to_owned()),
      self.config.agent_name.clone(),
      self.config.peer_private_key.as_ref(),
      our.root_num,
      our.root_id,
      our.head_num,
      our.head_id,
    );
  }

  pub fn send_handshakes(&self) {
    for peer in self.peers.iter() {
      self.send_handshake_to(&peer);
    }
  }

  fn send_go_away(&self, peer: &Arc<Peer>, reason: GoAwayReason) {
    peer.enqueue(
      QueueKind::General,
      &NetMessage::GoAway(GoAwayMessage { reason, node_id: self.node_id }),
    );
    peer.close(reason);
  }

  // ---- message handling -------------------------------------------

  pub async fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: NetMessage) {
    trace!("received {} from {}", msg.kind(), peer.peer_address);
    match msg {
      NetMessage::Handshake(m) => self.handle_handshake(peer, m),
      NetMessage::ChainSize(_) => {}
      NetMessage::GoAway(m) => {
        debug!("{} said go away: {:?}", peer.peer_address, m.reason);
        if m.reason.is_fatal() {
          *peer.no_retry.lock().expect("no_retry lock") = m.reason;
          self.mark_fatal(&peer.peer_address);
        }
        peer.close(GoAwayReason::NoReason);
      }
      NetMessage::Time(m) => peer.handle_time_message(&m),
      NetMessage::Notice(m) => self.handle_notice(peer, m),
      NetMessage::Request(m) => self.handle_request(peer, m).await,
      NetMessage::SyncRequest(m) => self.handle_sync_request(peer, m),
      NetMessage::Block(block) => self.handle_block(peer, block),
      NetMessage::PackedTransaction(trx) => self.handle_transaction(peer, trx),
      NetMessage::Vote(vote) => {
        let _ = self.events_tx.send(NetEvent::Vote { peer: peer.id, vote });
      }
      NetMessage::BlockNack(m) => self.handle_block_nack(peer, m),
      NetMessage::BlockNotice(m) => self.handle_block_notice(peer, m),
      NetMessage::GossipBpPeers(m) => self.handle_bp_gossip(peer, m),
      NetMessage::TransactionNotice(m) => self.handle_trx_notice(peer, m),
    }
  }

  fn mark_fatal(&self, address: &str) {
    let mut dials = self.dial_states.lock().expect("dial lock");
    if let Some(state) = dials.get_mut(address) {
      state.fatal = true;
    }
  }

  fn handle_handshake(self: &Arc<Self>, peer: &Arc<Peer>, msg: HandshakeMessage) {
    if msg.chain_id != self.chain_id {
      warn!("{} is on a different chain", peer.peer_address);
      self.send_go_away(peer, GoAwayReason::WrongChain);
      return;
    }
    let Some(capability) = ProtoVersion::from_announced(msg.network_version)
    else {
      self.send_go_away(peer, GoAwayReason::WrongVersion);
      return;
    };
    if msg.node_id == self.node_id {
      debug!("connected to ourselves via {}", peer.peer_address);
      self.send_go_away(peer, GoAwayReason::ItsSelf);
      return;
    }
    // handshake times are nanoseconds; the magnitude check rejects
    // millisecond and microsecond epochs outright
    if msg.time.as_nanos() < 100_000_000_000_000_000 {
      warn!("{} sent a non-nanosecond handshake time", peer.peer_address);
      self.send_go_away(peer, GoAwayReason::WrongVersion);
      return;
    }
    if !self.authenticate_peer(&msg) {
      warn!("failed to authenticate {}", peer.peer_address);
      self.send_go_away(peer, GoAwayReason::Authentication);
      return;
    }

    // duplicate node ids resolve asymmetrically: the side with the
    // lower node id closes its redundant connection
    let duplicate = self.peers.iter().any(|other| {
      other.id != peer.id
        && !other.is_closed()
        && other
          .last_handshake
          .lock()
          .expect("handshake lock")
          .as_ref()
          .map(|h| h.node_id == msg.node_id)
          .unwrap_or(false)
    });
    if duplicate && self.node_id < msg.node_id {
      debug!("duplicate connection to {}; closing", peer.peer_address);
      self.send_go_away(peer, GoAwayReason::Duplicate);
      return;
    }

    peer.set_capability(capability);
    *peer.last_handshake.lock().expect("handshake lock") = Some(msg.clone());

    let our = self.chain_info();
    let verdict = self.sync.handle_handshake(&our, peer.latency_blocks(), &msg);
    match verdict {
      HandshakeVerdict::InSyncWithUs => {
        peer.syncing_from_us.store(false, Ordering::Relaxed);
      }
      HandshakeVerdict::SendHandshake => self.send_handshake_to(peer),
      HandshakeVerdict::NoticeLastIrrCatchUp => {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::Notice(NoticeMessage {
            known_trx: OrderedIds {
              mode: IdListMode::LastIrrCatchUp,
              pending: our.head_num,
              ids: vec![],
            },
            known_blocks: OrderedIds {
              mode: IdListMode::LastIrrCatchUp,
              pending: our.root_num,
              ids: vec![],
            },
          }),
        );
      }
      HandshakeVerdict::StartSync => self.request_next_sync_chunk(),
      HandshakeVerdict::NoticeCatchUp => {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::Notice(NoticeMessage {
            known_trx: OrderedIds::default(),
            known_blocks: OrderedIds {
              mode: IdListMode::CatchUp,
              pending: our.head_num,
              ids: vec![our.head_id],
            },
          }),
        );
      }
      HandshakeVerdict::Idle => {}
    }
  }

  fn authenticate_peer(&self, msg: &HandshakeMessage) -> bool {
    match self.config.allowed_connection {
      AllowedConnection::Any => true,
      AllowedConnection::NoneAtAll => false,
      AllowedConnection::Specified | AllowedConnection::Producers => {
        let Some(sig) = &msg.sig else {
          return false;
        };
        if msg.token != HandshakeMessage::sign_token(msg.time) {
          return false;
        }
        if !msg.key.verify(msg.token.as_ref(), sig) {
          return false;
        }
        match self.config.allowed_connection {
          AllowedConnection::Specified => {
            self.config.peer_keys.contains(&msg.key)
          }
          AllowedConnection::Producers => {
            let fork = self.fork_db.read().expect("fork db lock");
            let schedule =
              fork.active().head().header_state.producer_schedule().clone();
            drop(fork);
            schedule.producers.iter().any(|p| p.signing_key == msg.key)
          }
          _ => unreachable!(),
        }
      }
    }
  }

  fn handle_notice(self: &Arc<Self>, peer: &Arc<Peer>, msg: NoticeMessage) {
    let our = self.chain_info();

    match msg.known_blocks.mode {
      IdListMode::LastIrrCatchUp => {
        self.sync.note_peer_lib(&our, msg.known_blocks.pending);
        self.request_next_sync_chunk();
      }
      IdListMode::CatchUp => {
        if let Some(head_id) = msg.known_blocks.ids.first() {
          let known = {
            let fork = self.fork_db.read().expect("fork db lock");
            fork.active().contains(head_id)
          };
          if !known {
            self.sync.begin_head_catchup(*head_id);
            peer.enqueue(
              QueueKind::General,
              &NetMessage::Request(RequestMessage {
                req_trx: OrderedIds::default(),
                req_blocks: OrderedIds {
                  mode: IdListMode::CatchUp,
                  pending: 0,
                  ids: vec![*head_id],
                },
              }),
            );
          }
        }
      }
      _ => {}
    }

    // transaction id announcements: ask for what we lack
    if msg.known_trx.mode == IdListMode::Normal {
      let missing: Vec<_> = msg
        .known_trx
        .ids
        .iter()
        .filter(|id| !self.dispatch.have_txn(id))
        .copied()
        .collect();
      if !missing.is_empty() {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::Request(RequestMessage {
            req_trx: OrderedIds {
              mode: IdListMode::Normal,
              pending: 0,
              ids: missing,
            },
            req_blocks: OrderedIds::default(),
          }),
        );
      }
    }
  }

  async fn handle_request(self: &Arc<Self>, peer: &Arc<Peer>, msg: RequestMessage) {
    match msg.req_blocks.mode {
      IdListMode::CatchUp => {
        // peer chases our head: stream the branch leading to it
        if let Some(target) = msg.req_blocks.ids.first() {
          self.serve_branch(peer, *target).await;
        }
      }
      IdListMode::Normal => {
        // a block-notice follow-up: ids are [wanted, have]
        if let (Some(wanted), Some(have)) =
          (msg.req_blocks.ids.first(), msg.req_blocks.ids.get(1))
        {
          let start = have.block_num() + 1;
          let end = wanted.block_num();
          if start <= end {
            self.serve_range(peer, start, end, true).await;
          }
        }
      }
      _ => {}
    }

    if msg.req_trx.mode == IdListMode::Normal {
      for id in &msg.req_trx.ids {
        if let Some(trx) = self.dispatch.get_txn(id) {
          self.dispatch.add_peer_txn(peer.id, *id);
          peer.enqueue(
            QueueKind::Trx,
            &NetMessage::PackedTransaction(Box::new(trx)),
          );
        }
      }
    }
  }

  fn handle_sync_request(self: &Arc<Self>, peer: &Arc<Peer>, msg: SyncRequestMessage) {
    if msg.start_block == 0 && msg.end_block == 0 {
      *peer.peer_requested.lock().expect("peer_requested lock") = None;
      peer.syncing_from_us.store(false, Ordering::Relaxed);
      return;
    }
    let our = self.chain_info();
    if msg.end_block > our.head_num {
      warn!(
        "{} requested blocks past our head ({} > {})",
        peer.peer_address, msg.end_block, our.head_num
      );
      self.send_go_away(peer, GoAwayReason::BenignOther);
      return;
    }
    peer.syncing_from_us.store(true, Ordering::Relaxed);
    *peer.peer_requested.lock().expect("peer_requested lock") =
      Some(PeerSyncState {
        start_block: msg.start_block,
        end_block: msg.end_block,
        last_sent: msg.start_block.saturating_sub(1),
        from_notice: false,
      });
    let net = self.clone();
    let peer = peer.clone();
    tokio::spawn(async move {
      net.serve_range(&peer, msg.start_block, msg.end_block, false).await;
      *peer.peer_requested.lock().expect("peer_requested lock") = None;
      peer.syncing_from_us.store(false, Ordering::Relaxed);
    });
  }

  /// Streams a block range to a catch-up peer over the block-sync
  /// queue, pacing on queue occupancy so one slow peer cannot pin
  /// unbounded memory.
  async fn serve_range(&self, peer: &Arc<Peer>, start: u32, end: u32, notice_driven: bool) {
    debug!(
      "serving blocks {start}..{end} to {} ({})",
      peer.peer_address,
      if notice_driven { "notice" } else { "sync" }
    );
    for num in start..=end {
      if peer.is_closed() {
        return;
      }
      while peer.queued_bytes() > self.config.max_write_queue_size / 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if peer.is_closed() {
          return;
        }
      }
      match self.read_block_by_num(num) {
        Some(block) => {
          self.dispatch.add_peer_block(peer.id, block.id());
          peer.enqueue(QueueKind::BlockSync, &NetMessage::Block(Box::new(block)));
          if let Some(state) =
            peer.peer_requested.lock().expect("peer_requested lock").as_mut()
          {
            state.last_sent = num;
          }
        }
        None => {
          warn!("cannot serve block {num}; not in log or fork database");
          return;
        }
      }
    }
    // invite the peer to renegotiate now that the range is done
    self.send_handshake_to(peer);
  }

  async fn serve_branch(&self, peer: &Arc<Peer>, target: BlockId) {
    let branch = {
      let fork = self.fork_db.read().expect("fork db lock");
      let mut blocks: Vec<Arc<SignedBlock>> = fork
        .active()
        .fetch_branch(target, None)
        .into_iter()
        .map(|b| b.block.clone())
        .collect();
      blocks.reverse();
      blocks
    };
    for block in branch {
      if peer.is_closed() {
        return;
      }
      while peer.queued_bytes() > self.config.max_write_queue_size / 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
      self.dispatch.add_peer_block(peer.id, block.id());
      peer.enqueue(
        QueueKind::BlockSync,
        &NetMessage::Block(Box::new((*block).clone())),
      );
    }
  }

  fn read_block_by_num(&self, num: u32) -> Option<SignedBlock> {
    if let Ok(Some(block)) = self.block_log.read_by_num(num) {
      return Some(block);
    }
    let fork = self.fork_db.read().expect("fork db lock");
    let head_id = fork.active().head().id();
    fork
      .active()
      .search_on_branch(head_id, num, true)
      .map(|b| (*b.block).clone())
  }

  fn handle_block(self: &Arc<Self>, peer: &Arc<Peer>, block: Box<SignedBlock>) {
    peer.record_block_received();
    let id = block.id();

    let already_known = {
      let fork = self.fork_db.read().expect("fork db lock");
      fork.active().contains(&id)
        || id.block_num() <= fork.active().root().block_num()
    };
    let first_from_peer = self.dispatch.add_peer_block(peer.id, id);

    if already_known {
      // a full block we did not need; nack so the sender can switch
      // to notices
      if first_from_peer
        && !self.config.disable_block_nack
        && peer.supports(ProtoVersion::BlockNack)
        && !self.sync.is_lib_catchup()
      {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::BlockNack(BlockNackMessage { id }),
        );
      }
      return;
    }

    let _ = self.events_tx.send(NetEvent::Block { peer: peer.id, block });
  }

  fn handle_transaction(
    self: &Arc<Self>,
    peer: &Arc<Peer>,
    trx: Box<PackedTransaction>,
  ) {
    if !self.config.accept_transactions {
      return;
    }
    let id = trx.id();
    self.dispatch.add_peer_txn(peer.id, id);
    if !self.dispatch.add_txn(&trx) {
      return; // duplicate
    }
    let _ = self.events_tx.send(NetEvent::Transaction { peer: peer.id, trx });
  }

  fn handle_block_nack(&self, peer: &Arc<Peer>, msg: BlockNackMessage) {
    if self.config.disable_block_nack {
      return;
    }
    let mut last_nack = peer.last_block_nack.lock().expect("nack lock");
    // consecutive means strictly descending from the previous nack
    let consecutive = last_nack.block_num() + 1 == msg.id.block_num()
      || *last_nack == BlockId::default();
    *last_nack = msg.id;
    if consecutive {
      let count =
        peer.consecutive_blocks_nacked.fetch_add(1, Ordering::Relaxed) + 1;
      if count == CONSECUTIVE_BLOCK_NACKS_THRESHOLD {
        debug!(
          "{} nacked {count} consecutive blocks; switching to notices",
          peer.peer_address
        );
      }
    } else {
      peer.consecutive_blocks_nacked.store(1, Ordering::Relaxed);
    }
  }

  fn handle_block_notice(self: &Arc<Self>, peer: &Arc<Peer>, msg: BlockNoticeMessage) {
    let our = self.chain_info();
    let (have_block, have_prev) = {
      let fork = self.fork_db.read().expect("fork db lock");
      (fork.active().contains(&msg.id), fork.active().contains(&msg.prev_id))
    };
    if have_block {
      return;
    }
    self.dispatch.add_peer_block(peer.id, msg.id);
    if have_prev {
      // only the tip is missing; ask for it alone
      peer.enqueue(
        QueueKind::General,
        &NetMessage::Request(RequestMessage {
          req_trx: OrderedIds::default(),
          req_blocks: OrderedIds {
            mode: IdListMode::Normal,
            pending: 0,
            ids: vec![msg.id, msg.prev_id],
          },
        }),
      );
      return;
    }
    // both unknown: fetch the gap from our head, once per ancestor id
    let mut marker =
      peer.last_block_nack_request_id.lock().expect("nack request lock");
    if *marker == msg.prev_id {
      return;
    }
    *marker = msg.prev_id;
    peer.enqueue(
      QueueKind::General,
      &NetMessage::Request(RequestMessage {
        req_trx: OrderedIds::default(),
        req_blocks: OrderedIds {
          mode: IdListMode::Normal,
          pending: 0,
          ids: vec![msg.prev_id, our.head_id],
        },
      }),
    );
  }

  fn handle_bp_gossip(self: &Arc<Self>, peer: &Arc<Peer>, msg: GossipBpPeersMessage) {
    if !self.config.bp_gossip {
      return;
    }
    if !peer.supports(ProtoVersion::GossipBpPeers) {
      return;
    }
    let mut book = self.bp_addresses.lock().expect("bp lock");
    for record in msg.peers {
      let Some(sig) = &record.sig else { continue };
      if !record.key.verify(record.signing_digest().as_ref(), sig) {
        warn!("ignoring bp gossip record with bad signature");
        continue;
      }
      book.insert(record.producer.clone(), record.p2p_address.clone());
    }
  }

  fn handle_trx_notice(&self, peer: &Arc<Peer>, msg: TransactionNoticeMessage) {
    if self.dispatch.have_txn(&msg.id) {
      return;
    }
    self
      .dispatch
      .add_txn_notice(msg.id, TimePoint::now() + self.config.dedup_cache_expire);
    peer.enqueue(
      QueueKind::General,
      &NetMessage::Request(RequestMessage {
        req_trx: OrderedIds {
          mode: IdListMode::Normal,
          pending: 0,
          ids: vec![msg.id],
        },
        req_blocks: OrderedIds::default(),
      }),
    );
  }

  // ---- sync glue ---------------------------------------------------

  pub fn request_next_sync_chunk(&self) {
    let our = self.chain_info();
    let summaries: Vec<PeerSummary> = self
      .peers
      .iter()
      .filter(|p| !p.is_closed())
      .filter_map(|p| {
        let handshake = p.last_handshake.lock().expect("handshake lock");
        handshake.as_ref().map(|h| PeerSummary {
          id: p.id,
          latency_blocks: p.latency_blocks(),
          fork_db_head_num: h.fork_db_head_num,
          fork_db_root_num: h.fork_db_root_num,
        })
      })
      .collect();

    if let Some((peer_id, request)) =
      self.sync.next_chunk_request(&our, &summaries)
    {
      if let Some(peer) = self.peers.get(&peer_id) {
        peer.enqueue(QueueKind::General, &NetMessage::SyncRequest(request));
      }
    }
  }

  /// Bookkeeping after the node accepted a block from a peer.
  pub fn block_accepted(&self, peer_id: u64, id: BlockId, applied_head: u32) {
    self.set_applied_head(applied_head);
    match self.sync.block_received(peer_id, id.block_num()) {
      SyncProgress::RequestNext => self.request_next_sync_chunk(),
      SyncProgress::Finished => self.send_handshakes(),
      SyncProgress::Continue => {}
    }
    if self.sync.head_target() == Some(id) {
      self.sync.head_caught_up();
      self.send_handshakes();
    }
  }

  pub fn close_peer(&self, peer_id: u64, reason: GoAwayReason) {
    if let Some(peer) = self.peers.get(&peer_id) {
      self.send_go_away(&peer, reason);
    }
  }

  /// A peer delivered a block that failed validation.
  pub fn block_rejected(&self, peer_id: u64, close: bool) {
    let our = self.chain_info();
    self.sync.rejected_block(&our, peer_id);
    if let Some(peer) = self.peers.get(&peer_id) {
      if close {
        self.send_go_away(&peer, GoAwayReason::Validation);
      }
    }
    self.request_next_sync_chunk();
  }

  // ---- broadcast --------------------------------------------------

  /// Relays a newly validated block to every peer that has not seen
  /// it. Repeated nackers get a notice instead, except for blocks we
  /// produced ourselves.
  pub fn broadcast_block(&self, block: &SignedBlock, self_produced: bool) {
    let id = block.id();
    let prev_id = block.header().previous;
    for peer in self.peers.iter() {
      if peer.is_closed() || !peer.accepts_blocks.load(Ordering::Relaxed) {
        continue;
      }
      if !self.dispatch.add_peer_block(peer.id, id) {
        continue; // already has it
      }
      let use_notice = !self.config.disable_block_nack
        && !self_produced
        && peer.supports(ProtoVersion::BlockNack)
        && peer.consecutive_blocks_nacked.load(Ordering::Relaxed)
          >= CONSECUTIVE_BLOCK_NACKS_THRESHOLD;
      if use_notice {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::BlockNotice(BlockNoticeMessage { prev_id, id }),
        );
      } else {
        peer.enqueue(
          QueueKind::General,
          &NetMessage::Block(Box::new(block.clone())),
        );
      }
    }
  }

  /// Relays an accepted transaction to peers that accept transactions
  /// and have not seen it; large payloads go notice-first to capable
  /// peers.
  pub fn broadcast_transaction(&self, trx: &PackedTransaction) {
    let id = trx.id();
    let large = trx.packed_size() > TRX_NOTICE_SIZE_THRESHOLD;
    for peer in self.peers.iter() {
      if peer.is_closed()
        || !peer.accepts_transactions.load(Ordering::Relaxed)
      {
        continue;
      }
      if self.dispatch.peer_has_txn(peer.id, &id) {
        continue;
      }
      self.dispatch.add_peer_txn(peer.id, id);
      if large && peer.supports(ProtoVersion::TrxNotice) {
        peer.enqueue(
          QueueKind::Trx,
          &NetMessage::TransactionNotice(TransactionNoticeMessage { id }),
        );
      } else {
        peer.enqueue(
          QueueKind::Trx,
          &NetMessage::PackedTransaction(Box::new(trx.clone())),
        );
      }
    }
  }

  pub fn broadcast_vote(&self, vote: &VoteMessage) {
    for peer in self.peers.iter() {
      if peer.is_closed() {
        continue;
      }
      peer.enqueue(QueueKind::General, &NetMessage::Vote(vote.clone()));
    }
  }

  /// Gossips our own producer endpoint record to producer peers.
  pub fn gossip_own_bp_endpoint(
    &self,
    producer: AccountName,
    key: &Keypair,
  ) {
    let Some(address) = self.config.p2p_server_address.clone() else {
      return;
    };
    use ed25519_dalek::Signer;
    let mut record = SignedBpPeer {
      producer,
      p2p_address: address,
      time: TimePoint::now(),
      key: key.public(),
      sig: None,
    };
    record.sig = Some(key.sign(record.signing_digest().as_ref()));
    let msg = NetMessage::GossipBpPeers(GossipBpPeersMessage {
      peers: vec![record],
    });
    for peer in self.peers.iter() {
      if !peer.is_closed() && peer.supports(ProtoVersion::GossipBpPeers) {
        peer.enqueue(QueueKind::General, &msg);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn listen_endpoint_parsing() {
    assert_eq!(
      ListenEndpoint::parse("0.0.0.0:9876").unwrap(),
      ListenEndpoint {
        addr: "0.0.0.0:9876".into(),
        kind: EndpointKind::Both,
        block_sync_rate_limit: None,
      }
    );
    assert_eq!(
      ListenEndpoint::parse("127.0.0.1:9877:trx").unwrap().kind,
      EndpointKind::TransactionsOnly
    );
    let ep = ListenEndpoint::parse("127.0.0.1:9878:blk:1MB/s").unwrap();
    assert_eq!(ep.kind, EndpointKind::BlocksOnly);
    assert_eq!(ep.block_sync_rate_limit, Some(1_000_000));

    assert!(ListenEndpoint::parse("nohost").is_err());
    assert!(ListenEndpoint::parse("host:notaport").is_err());
    assert!(ListenEndpoint::parse("host:9876:blk:fast").is_err());
  }

  #[test]
  fn rate_parsing() {
    assert_eq!(parse_rate("500B/s").unwrap(), 500);
    assert_eq!(parse_rate("500KB/s").unwrap(), 500_000);
    assert_eq!(parse_rate("2GB/s").unwrap(), 2_000_000_000);
    assert!(parse_rate("2MB").is_err());
  }
}
