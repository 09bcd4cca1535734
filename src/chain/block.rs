use {
  super::{
    header::SignedBlockHeader,
    qc::Qc,
  },
  crate::primitives::{
    AccountName,
    BlockId,
    Digest,
    Pubkey,
    TimePoint,
    TransactionId,
  },
  rayon::prelude::*,
  serde::{Deserialize, Serialize},
  std::sync::Arc,
};

/// An action is an opaque contract invocation; its semantics live
/// entirely inside the external execution layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
  pub account: AccountName,
  pub name: String,
  pub authorizer: AccountName,
  pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub expiration: TimePoint,
  /// Low 16 bits of a recent block number; ties the transaction to
  /// this chain's recent history.
  pub ref_block_num: u16,
  /// Keys expected to have signed this transaction, in signature
  /// order. Whether they satisfy the authorizers' account authorities
  /// is decided by the external permission layer.
  pub authorizers: Vec<Pubkey>,
  pub actions: Vec<Action>,
}

impl Transaction {
  pub fn id(&self) -> TransactionId {
    Digest::hash(bincode::serialize(self).expect("transaction serializes"))
  }

  pub fn signing_digest(&self, chain_id: &Digest) -> Digest {
    let mut preimage = chain_id.to_bytes().to_vec();
    preimage
      .extend_from_slice(&bincode::serialize(self).expect("serializes"));
    Digest::hash(&preimage)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
  pub transaction: Transaction,
  pub signatures: Vec<ed25519_dalek::Signature>,
}

/// Wire and storage form of a transaction. The id is the digest of the
/// unsigned payload, so it is stable across signature malleation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedTransaction(pub SignedTransaction);

impl PackedTransaction {
  pub fn id(&self) -> TransactionId {
    self.0.transaction.id()
  }

  pub fn expiration(&self) -> TimePoint {
    self.0.transaction.expiration
  }

  pub fn packed_size(&self) -> usize {
    bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
  }
}

/// A packed transaction with its signature-recovery cache. Recovering
/// keys is the expensive part of admission, so it happens once, on the
/// chain thread pool, and travels with the transaction from there on.
#[derive(Clone, Debug)]
pub struct TransactionMetadata {
  pub packed: PackedTransaction,
  pub id: TransactionId,
  pub recovered_keys: Vec<Pubkey>,
  /// Set for the implicit onblock transaction, which is synthesized
  /// rather than received.
  pub implicit: bool,
}

impl TransactionMetadata {
  /// Verifies every signature against the declared authorizer key at
  /// the same position and caches the verified keys. Batches above a
  /// handful of signatures verify in parallel on the caller's rayon
  /// pool.
  pub fn recover_keys(
    packed: PackedTransaction,
    chain_id: &Digest,
  ) -> Result<Arc<Self>, super::error::TransactionError> {
    let digest = packed.0.transaction.signing_digest(chain_id);
    let authorizers = &packed.0.transaction.authorizers;
    let signatures = &packed.0.signatures;

    if authorizers.len() != signatures.len() {
      return Err(super::error::TransactionError::Authorization(
        "signature count does not match declared authorizers".into(),
      ));
    }

    let verify = |(key, sig): (&Pubkey, &ed25519_dalek::Signature)| {
      key.verify(digest.as_ref(), sig)
    };

    let pairs: Vec<_> = authorizers.iter().zip(signatures.iter()).collect();
    let all_valid = if pairs.len() > 4 {
      pairs.into_par_iter().all(verify)
    } else {
      pairs.into_iter().all(verify)
    };
    if !all_valid {
      return Err(super::error::TransactionError::Authorization(
        "signature does not verify against its declared key".into(),
      ));
    }

    Ok(Arc::new(Self {
      id: packed.id(),
      recovered_keys: packed.0.transaction.authorizers.clone(),
      packed,
      implicit: false,
    }))
  }

  pub fn implicit(packed: PackedTransaction) -> Arc<Self> {
    Arc::new(Self {
      id: packed.id(),
      packed,
      recovered_keys: vec![],
      implicit: true,
    })
  }
}

#[derive(
  Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum TransactionStatus {
  /// Executed and committed.
  Executed,
  /// Objectively failed but the failure itself is part of the block
  /// (scheduled transactions only).
  HardFail,
  /// Error handler ran in place of the transaction.
  SoftFail,
  /// A scheduled transaction whose delay has not elapsed.
  Delayed,
  /// Expired without execution; only the id remains.
  Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptTransaction {
  Id(TransactionId),
  Packed(PackedTransaction),
}

impl ReceiptTransaction {
  pub fn id(&self) -> TransactionId {
    match self {
      ReceiptTransaction::Id(id) => *id,
      ReceiptTransaction::Packed(p) => p.id(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
  pub status: TransactionStatus,
  pub cpu_usage_us: u32,
  pub net_usage_words: u32,
  pub trx: ReceiptTransaction,
}

impl TransactionReceipt {
  /// Leaf digest for the transaction merkle root.
  pub fn digest(&self) -> Digest {
    Digest::hash(bincode::serialize(self).expect("receipt serializes"))
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockExtension {
  QuorumCertificate(Qc),
  AdditionalSignatures(Vec<ed25519_dalek::Signature>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
  pub signed_header: SignedBlockHeader,
  pub transactions: Vec<TransactionReceipt>,
  pub block_extensions: Vec<BlockExtension>,
}

impl SignedBlock {
  pub fn header(&self) -> &super::header::BlockHeader {
    &self.signed_header.header
  }

  pub fn id(&self) -> BlockId {
    self.signed_header.header.calculate_id()
  }

  pub fn block_num(&self) -> u32 {
    self.signed_header.header.block_num()
  }

  pub fn quorum_certificate_extension(&self) -> Option<&Qc> {
    self.block_extensions.iter().find_map(|e| match e {
      BlockExtension::QuorumCertificate(qc) => Some(qc),
      _ => None,
    })
  }

  pub fn receipt_digests(&self) -> Vec<Digest> {
    self.transactions.iter().map(|r| r.digest()).collect()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      chain::header::BlockHeader,
      primitives::{BlockTimestamp, Keypair},
    },
  };

  fn sample_block() -> SignedBlock {
    let keypair: Keypair = "9wkzHU5nqzvAdGPjvXZCsEkUwiHExdE9mTCYLVMzgm81"
      .parse()
      .unwrap();
    let header = BlockHeader {
      timestamp: BlockTimestamp(77),
      producer: "prod".into(),
      confirmed: 0,
      previous: BlockId::new(Digest::hash(b"p"), 6),
      transaction_mroot: Digest::default(),
      action_mroot: Digest::default(),
      schedule_version: 1,
      new_producers: None,
      header_extensions: vec![],
    };
    use ed25519_dalek::Signer;
    let producer_signature = keypair.sign(header.digest().as_ref());
    SignedBlock {
      signed_header: SignedBlockHeader { header, producer_signature },
      transactions: vec![TransactionReceipt {
        status: TransactionStatus::Executed,
        cpu_usage_us: 100,
        net_usage_words: 12,
        trx: ReceiptTransaction::Id(Digest::hash(b"trx")),
      }],
      block_extensions: vec![],
    }
  }

  #[test]
  fn serde_roundtrip_is_bit_exact() {
    let block = sample_block();
    let bytes = bincode::serialize(&block).unwrap();
    let decoded: SignedBlock = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, block);
    assert_eq!(bincode::serialize(&decoded).unwrap(), bytes);
  }

  #[test]
  fn receipt_digest_covers_status() {
    let block = sample_block();
    let mut receipt = block.transactions[0].clone();
    let before = receipt.digest();
    receipt.status = TransactionStatus::HardFail;
    assert_ne!(receipt.digest(), before);
  }
}
