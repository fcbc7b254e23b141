//! Error taxonomy for the grid engine.
//!
//! Most of the domain conditions in [`crate::accountant`] and [`crate::grid`]
//! are *expected* (insufficient funds, a phantom order, a stale commit) and
//! never unwind — they come back as `bool`/`Option` or as a signal recorded
//! on the manager and consumed by orchestration. [`GridError`] carries only
//! the variants that genuinely cross an API boundary: a chain RPC failure, a
//! malformed wire record, a lock timeout, or a programming error.

use thiserror::Error;

/// Errors returned from public engine operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// The chain client returned an error or the connection failed.
    #[error("chain rpc error: {0}")]
    ChainRpc(String),

    /// A chain order or fill record could not be parsed; the caller should
    /// skip the offending record and continue with the rest of the batch.
    #[error("failed to parse {context}: {reason}")]
    Parse { context: &'static str, reason: String },

    /// A non-reentrant lock could not be acquired within its deadline.
    #[error("timed out waiting for {lock} lock after {waited_ms}ms")]
    LockTimeout { lock: &'static str, waited_ms: u64 },

    /// A precondition that should be impossible under correct usage was
    /// violated (bad slot id, index repair failure, unknown state). These
    /// indicate a programming error rather than a domain condition.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// A rejected state transition, recorded rather than thrown per the
/// propagation policy: rejected transitions are logged and surfaced to the
/// orchestration layer as a signal it can inspect and clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalStateSignal {
    pub slot_id: crate::order::SlotId,
    pub attempted: String,
    pub reason: String,
}

/// An accounting invariant violation recorded for the orchestration layer's
/// single-recovery-attempt-per-cycle policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingFailure {
    pub side: crate::order::Side,
    pub description: String,
}
