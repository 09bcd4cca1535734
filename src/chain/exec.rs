//! The transaction execution seam.
//!
//! Contract execution itself (VM, metering, permissions) is an
//! external collaborator reached through [`TransactionExecutor`]. The
//! controller only cares that execution is deterministic, respects
//! the deadline timer, and reports per-action digests for the action
//! merkle root.

use {
  super::{
    block::{Action, Transaction},
    error::{InterruptError, SubjectiveError, TransactionError},
  },
  crate::{
    primitives::{Digest, TimePoint, TransactionId},
    state::StateStore,
  },
  std::sync::atomic::{AtomicI64, AtomicU8, Ordering},
};

/// Which in-flight transactions an interrupt applies to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptKind {
  AllTrx,
  SpeculativeBlockTrx,
  ApplyBlockTrx,
}

/// Whether the currently executing transaction is speculative or part
/// of a block replay. Decides which interrupts hit it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecClass {
  Speculative,
  ApplyBlock,
}

/// Shared deadline and interrupt flags, observed cooperatively by the
/// executor between actions.
#[derive(Debug, Default)]
pub struct ExecTimer {
  /// Wall-clock deadline in nanoseconds; 0 means none.
  deadline_ns: AtomicI64,
  /// 0 none, 1 all, 2 speculative, 3 apply.
  interrupt: AtomicU8,
}

impl ExecTimer {
  pub fn set_deadline(&self, deadline: TimePoint) {
    self.deadline_ns.store(deadline.as_nanos(), Ordering::Release);
  }

  pub fn clear_deadline(&self) {
    self.deadline_ns.store(0, Ordering::Release);
  }

  pub fn interrupt(&self, kind: InterruptKind) {
    let value = match kind {
      InterruptKind::AllTrx => 1,
      InterruptKind::SpeculativeBlockTrx => 2,
      InterruptKind::ApplyBlockTrx => 3,
    };
    self.interrupt.store(value, Ordering::Release);
  }

  pub fn clear_interrupt(&self) {
    self.interrupt.store(0, Ordering::Release);
  }

  /// Deadline and interrupt check, called between units of work.
  pub fn check(&self, class: ExecClass) -> Result<(), ExecFailure> {
    match (self.interrupt.load(Ordering::Acquire), class) {
      (1, _)
      | (2, ExecClass::Speculative)
      | (3, ExecClass::ApplyBlock) => return Err(ExecFailure::Interrupted),
      _ => {}
    }
    let deadline = self.deadline_ns.load(Ordering::Acquire);
    if deadline != 0 && TimePoint::now().as_nanos() > deadline {
      return Err(ExecFailure::DeadlineExceeded);
    }
    Ok(())
  }
}

/// How an execution attempt went wrong.
#[derive(Debug)]
pub enum ExecFailure {
  /// Deterministic failure; all nodes agree.
  Objective(TransactionError),
  /// Local deadline; only the producer sees it.
  DeadlineExceeded,
  /// `interrupt_transaction` fired.
  Interrupted,
}

impl From<ExecFailure> for super::error::ChainError {
  fn from(f: ExecFailure) -> Self {
    match f {
      ExecFailure::Objective(e) => e.into(),
      ExecFailure::DeadlineExceeded => {
        SubjectiveError::DeadlineExceeded.into()
      }
      ExecFailure::Interrupted => InterruptError.into(),
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOutput {
  pub action_digests: Vec<Digest>,
  pub cpu_usage_us: u32,
  pub net_usage_words: u32,
}

/// Deterministic single-transaction execution against the state
/// store. Implementations must not read anything outside `state`.
pub trait TransactionExecutor: Send + Sync {
  fn execute(
    &self,
    state: &mut StateStore,
    trx: &Transaction,
    timer: &ExecTimer,
    class: ExecClass,
  ) -> Result<ExecutionOutput, ExecFailure>;
}

/// The in-tree executor. Each action writes the digest of its payload
/// under an account-scoped key, which gives every transaction a
/// deterministic state effect and a deterministic action digest
/// without a contract VM.
#[derive(Debug, Default)]
pub struct KvExecutor;

impl KvExecutor {
  fn apply_action(
    &self,
    state: &mut StateStore,
    action: &Action,
  ) -> Result<Digest, TransactionError> {
    if action.name == "reject" {
      return Err(TransactionError::Execution(
        "contract rejected the action".into(),
      ));
    }

    let mut key = b"acct/".to_vec();
    key.extend_from_slice(action.account.as_str().as_bytes());
    key.push(b'/');
    key.extend_from_slice(action.name.as_bytes());

    let payload_digest = Digest::hash(&action.data);
    let prior = state.get(&key).cloned().unwrap_or_default();
    let mut next = prior;
    next.extend_from_slice(payload_digest.as_ref());
    let next = Digest::hash(&next).to_bytes().to_vec();
    state.put(key, next.clone());

    // the action receipt digest commits to both the input and the
    // resulting state cell
    let mut preimage = payload_digest.to_bytes().to_vec();
    preimage.extend_from_slice(&next);
    Ok(Digest::hash(&preimage))
  }
}

impl TransactionExecutor for KvExecutor {
  fn execute(
    &self,
    state: &mut StateStore,
    trx: &Transaction,
    timer: &ExecTimer,
    class: ExecClass,
  ) -> Result<ExecutionOutput, ExecFailure> {
    let mut output = ExecutionOutput::default();
    for action in &trx.actions {
      timer.check(class)?;
      let digest = self
        .apply_action(state, action)
        .map_err(ExecFailure::Objective)?;
      output.action_digests.push(digest);
      output.cpu_usage_us += 25 + action.data.len() as u32 / 16;
    }
    let size = bincode::serialized_size(trx).unwrap_or(0);
    output.net_usage_words = (size as u32 + 7) / 8;
    Ok(output)
  }
}

/// The result surface `push_transaction` reports back to callers;
/// `except` carries the failure for rejected transactions.
#[derive(Clone, Debug)]
pub struct TransactionTrace {
  pub id: TransactionId,
  pub block_num: u32,
  pub status: Option<super::block::TransactionStatus>,
  pub cpu_usage_us: u32,
  pub net_usage_words: u32,
  pub action_digests: Vec<Digest>,
  pub except: Option<String>,
}

impl TransactionTrace {
  pub fn failed(id: TransactionId, block_num: u32, except: String) -> Self {
    Self {
      id,
      block_num,
      status: None,
      cpu_usage_us: 0,
      net_usage_words: 0,
      action_digests: vec![],
      except: Some(except),
    }
  }
}

#[cfg(test)]
mod tests {
  use {super::*, crate::chain::block::Action};

  fn sample_trx(actions: Vec<Action>) -> Transaction {
    Transaction {
      expiration: TimePoint::from_millis(10_000),
      ref_block_num: 0,
      authorizers: vec![],
      actions,
    }
  }

  fn action(name: &str, data: &[u8]) -> Action {
    Action {
      account: "alice".into(),
      name: name.into(),
      authorizer: "alice".into(),
      data: data.to_vec(),
    }
  }

  #[test]
  fn execution_is_deterministic() {
    let exec = KvExecutor;
    let timer = ExecTimer::default();
    let trx = sample_trx(vec![action("put", b"hello"), action("put", b"bye")]);

    let mut s1 = StateStore::new();
    let mut s2 = StateStore::new();
    let o1 = exec
      .execute(&mut s1, &trx, &timer, ExecClass::Speculative)
      .unwrap();
    let o2 = exec
      .execute(&mut s2, &trx, &timer, ExecClass::Speculative)
      .unwrap();

    assert_eq!(o1.action_digests, o2.action_digests);
    assert_eq!(s1.integrity_hash(), s2.integrity_hash());
  }

  #[test]
  fn rejecting_action_is_objective() {
    let exec = KvExecutor;
    let timer = ExecTimer::default();
    let trx = sample_trx(vec![action("reject", b"")]);
    let mut state = StateStore::new();
    assert!(matches!(
      exec.execute(&mut state, &trx, &timer, ExecClass::Speculative),
      Err(ExecFailure::Objective(_))
    ));
  }

  #[test]
  fn interrupts_respect_class() {
    let timer = ExecTimer::default();
    timer.interrupt(InterruptKind::SpeculativeBlockTrx);
    assert!(timer.check(ExecClass::Speculative).is_err());
    assert!(timer.check(ExecClass::ApplyBlock).is_ok());

    timer.interrupt(InterruptKind::AllTrx);
    assert!(timer.check(ExecClass::ApplyBlock).is_err());

    timer.clear_interrupt();
    assert!(timer.check(ExecClass::Speculative).is_ok());
  }
}
