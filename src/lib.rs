//! `gridkeep`: a boundary-crawl grid-trading engine.
//!
//! The crate is layered the way the engine itself is layered: a frozen,
//! versioned grid (`grid`, `order`) mutated only through a
//! private working copy; synchronous engines over that state (`primitives`,
//! `accountant`, `strategy`, `reconciler`, `sync`); the async orchestrator
//! that owns the lock discipline and commit protocol (`manager`); the
//! external collaborator traits the host implements (`chain`,
//! `persistence`, `assets`); and the ambient stack every production crate
//! in this line carries regardless of domain scope (`config`, `error`,
//! `logging`, `monitoring`).

pub mod accountant;
pub mod assets;
pub mod chain;
pub mod config;
pub mod error;
pub mod grid;
pub mod logging;
pub mod manager;
pub mod monitoring;
pub mod order;
pub mod persistence;
pub mod primitives;
pub mod reconciler;
pub mod strategy;
pub mod sync;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use accountant::{Accountant, FillOp, SideAmounts};
pub use config::GridConfig;
pub use error::GridError;
pub use grid::{MasterGrid, MasterSnapshot, WorkingGrid};
pub use manager::GridManager;
pub use order::{ChainOrderId, Order, OrderKind, OrderState, Side, SlotId};
