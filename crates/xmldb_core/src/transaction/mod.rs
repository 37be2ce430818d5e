//! Transactions and recovery.
//!
//! A transaction moves through
//!
//! ```text
//! Active ─► Committing ─► Committed
//!    │           │
//!    └───────────┴──► Aborting ─► Aborted
//! ```
//!
//! Every mutation is journaled when it is made. Commit forces the
//! transaction's commit record to the journal before the new state is
//! published; a failed force aborts the transaction. On start-up after an
//! unclean shutdown, [`replay`] re-applies committed transactions in
//! commit order and drops everything else.

mod manager;
mod recovery;
mod state;

pub use manager::{ManagerOptions, TransactionManager};
pub use recovery::{replay, RecoveryReport};
pub use state::{Transaction, TransactionState};
