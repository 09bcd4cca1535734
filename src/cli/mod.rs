use {
  crate::{
    chain::{self, Genesis},
    net::{AllowedConnection, ListenEndpoint, NetConfig},
    primitives::{AccountName, BlsKeypair, Keypair, Pubkey},
  },
  clap::Parser,
  std::{path::PathBuf, time::Duration},
};

#[derive(Debug, Parser)]
#[clap(version, about = "veldt blockchain node")]
pub struct CliOpts {
  #[clap(long, help = "path to the genesis json file")]
  pub genesis: PathBuf,

  #[clap(long, help = "directory for chain state")]
  pub state_dir: Option<PathBuf>,

  #[clap(long, help = "directory for the block log")]
  pub blocks_dir: Option<PathBuf>,

  #[clap(long, help = "directory for finalizer safety records")]
  pub finalizers_dir: Option<PathBuf>,

  #[clap(
    long,
    help = "block signing key of this producer; enables production"
  )]
  pub producer_key: Option<Keypair>,

  #[clap(long, help = "name of the producer account operated here")]
  pub producer_name: Option<String>,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "BLS finalizer key(s) operated by this node"
  )]
  pub finalizer_key: Vec<BlsKeypair>,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "listen endpoint host:port[:trx|:blk][:rate], may repeat"
  )]
  pub p2p_listen_endpoint: Vec<String>,

  #[clap(long, help = "externally visible address announced to peers")]
  pub p2p_server_address: Option<String>,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "peer address host:port to dial, may repeat"
  )]
  pub p2p_peer_address: Vec<String>,

  #[clap(long, default_value = "1")]
  pub p2p_max_nodes_per_host: usize,

  #[clap(long, help = "process incoming transactions", parse(try_from_str), default_value = "true")]
  pub p2p_accept_transactions: bool,

  #[clap(long, help = "disable the block-nack notice optimization")]
  pub p2p_disable_block_nack: bool,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "account,endpoint pair dialed while the account produces"
  )]
  pub p2p_auto_bp_peer: Vec<String>,

  #[clap(long, help = "participate in producer endpoint gossip")]
  pub p2p_bp_gossip_endpoint: bool,

  #[clap(long, default_value = "veldt agent")]
  pub agent_name: String,

  #[clap(
    long,
    default_value = "any",
    help = "authentication policy: any, producers, specified, none"
  )]
  pub allowed_connection: String,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "public key allowed to connect under `specified`"
  )]
  pub peer_key: Vec<Pubkey>,

  #[clap(long, help = "key used to sign our handshakes")]
  pub peer_private_key: Option<Keypair>,

  #[clap(long, default_value = "25")]
  pub max_clients: usize,

  #[clap(long, default_value = "30", help = "seconds between dial retries")]
  pub connection_cleanup_period: u64,

  #[clap(long, default_value = "10")]
  pub p2p_dedup_cache_expire_time_sec: u64,

  #[clap(long, default_value = "2")]
  pub net_threads: usize,

  #[clap(long, default_value = "1000")]
  pub sync_fetch_span: u32,

  #[clap(long, default_value = "3")]
  pub sync_peer_limit: usize,

  #[clap(long, default_value = "10000")]
  pub p2p_keepalive_interval_ms: u64,

  #[clap(long, default_value = "4")]
  pub chain_thread_pool_size: usize,

  #[clap(long, default_value = "4")]
  pub vote_thread_pool_size: usize,

  #[clap(
    long,
    default_value = "HEAD",
    help = "read mode: HEAD, SPECULATIVE or IRREVERSIBLE"
  )]
  pub read_mode: String,

  #[clap(long, default_value = "FULL", help = "validation mode: FULL or LIGHT")]
  pub validation_mode: String,

  #[clap(long, help = "stop once this block becomes the head")]
  pub terminate_at_block: Option<u32>,

  #[clap(long, help = "re-verify everything, trusted or not")]
  pub force_all_checks: bool,

  #[clap(long, help = "disable replay optimizations")]
  pub disable_replay_opts: bool,

  #[clap(long, help = "log the state integrity hash on startup")]
  pub integrity_hash_on_start: bool,

  #[clap(long, help = "log the state integrity hash on shutdown")]
  pub integrity_hash_on_stop: bool,

  #[clap(
    long,
    multiple_occurrences = true,
    help = "account whose transactions get profiled"
  )]
  pub profile_accounts: Vec<String>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  pub fn genesis(&self) -> anyhow::Result<Genesis> {
    let raw = std::fs::read_to_string(&self.genesis)?;
    Ok(serde_json::from_str(&raw)?)
  }

  pub fn read_mode(&self) -> anyhow::Result<chain::ReadMode> {
    match self.read_mode.to_uppercase().as_str() {
      "HEAD" => Ok(chain::ReadMode::Head),
      "SPECULATIVE" => Ok(chain::ReadMode::Speculative),
      "IRREVERSIBLE" => Ok(chain::ReadMode::Irreversible),
      other => anyhow::bail!("unknown read mode {other}"),
    }
  }

  pub fn validation_mode(&self) -> anyhow::Result<chain::ValidationMode> {
    match self.validation_mode.to_uppercase().as_str() {
      "FULL" => Ok(chain::ValidationMode::Full),
      "LIGHT" => Ok(chain::ValidationMode::Light),
      other => anyhow::bail!("unknown validation mode {other}"),
    }
  }

  pub fn allowed_connection(&self) -> anyhow::Result<AllowedConnection> {
    match self.allowed_connection.to_lowercase().as_str() {
      "any" => Ok(AllowedConnection::Any),
      "producers" => Ok(AllowedConnection::Producers),
      "specified" => Ok(AllowedConnection::Specified),
      "none" => Ok(AllowedConnection::NoneAtAll),
      other => anyhow::bail!("unknown allowed-connection {other}"),
    }
  }

  pub fn chain_config(&self) -> anyhow::Result<chain::Config> {
    Ok(chain::Config {
      state_dir: self.state_dir.clone(),
      blocks_dir: self.blocks_dir.clone(),
      finalizers_dir: self.finalizers_dir.clone(),
      read_mode: self.read_mode()?,
      validation_mode: self.validation_mode()?,
      force_all_checks: self.force_all_checks,
      terminate_at_block: self.terminate_at_block,
      chain_thread_pool_size: self.chain_thread_pool_size,
      ..chain::Config::default()
    })
  }

  pub fn net_config(&self) -> anyhow::Result<NetConfig> {
    let listen_endpoints = self
      .p2p_listen_endpoint
      .iter()
      .map(|spec| {
        ListenEndpoint::parse(spec).map_err(|e| anyhow::anyhow!(e))
      })
      .collect::<anyhow::Result<Vec<_>>>()?;

    let auto_bp_peers = self
      .p2p_auto_bp_peer
      .iter()
      .map(|spec| {
        spec
          .split_once(',')
          .map(|(account, addr)| {
            (AccountName::new(account), addr.to_owned())
          })
          .ok_or_else(|| {
            anyhow::anyhow!("auto-bp-peer must be account,endpoint")
          })
      })
      .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(NetConfig {
      listen_endpoints,
      p2p_server_address: self.p2p_server_address.clone(),
      peers: self.p2p_peer_address.clone(),
      agent_name: self.agent_name.clone(),
      allowed_connection: self.allowed_connection()?,
      peer_keys: self.peer_key.clone(),
      peer_private_key: self.peer_private_key.clone(),
      max_clients: self.max_clients,
      max_nodes_per_host: self.p2p_max_nodes_per_host,
      accept_transactions: self.p2p_accept_transactions,
      disable_block_nack: self.p2p_disable_block_nack,
      auto_bp_peers,
      bp_gossip: self.p2p_bp_gossip_endpoint,
      connector_period: Duration::from_secs(self.connection_cleanup_period),
      dedup_cache_expire: Duration::from_secs(
        self.p2p_dedup_cache_expire_time_sec,
      ),
      sync_fetch_span: self.sync_fetch_span,
      sync_peer_limit: self.sync_peer_limit,
      keepalive_interval: Duration::from_millis(self.p2p_keepalive_interval_ms),
      irreversible_mode: matches!(
        self.read_mode()?,
        chain::ReadMode::Irreversible
      ),
      ..NetConfig::default()
    })
  }
}
