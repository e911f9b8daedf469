//! Crash-atomic update machinery: the durable redo log ([`redo`]), the
//! per-transaction accumulation of pending word writes ([`op`]), and the
//! scoped transaction object with its abort queue ([`tx`]).

pub mod op;
pub mod redo;
pub mod tx;

pub use op::{OpContext, OpKind};
pub use redo::{RedoEntry, RedoLog, FINISH_FLAG};
pub use tx::Transaction;
