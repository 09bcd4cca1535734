mod b58;
mod id;
mod keys;
mod merkle;
mod time;

pub use {
  b58::ToBase58String,
  id::{AccountName, BlockId, Digest, TransactionId},
  keys::{BlsKeypair, BlsPubkey, BlsSignature, Keypair, Pubkey},
  merkle::{canonical_merkle, legacy_merkle},
  time::{BlockTimestamp, TimePoint, BLOCK_INTERVAL_MS},
};
