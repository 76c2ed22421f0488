//! Ledger and reconciliation engine for a shared energy battery bank.
//!
//! Producers deposit surplus energy into a bank run by a single owner; the
//! owner later draws that energy and the two sides settle up. [`ledger`]
//! holds the bank record and the per-producer ledgers with their store and
//! consume transitions, plus hashed snapshots. [`reconcile`] is the one
//! place that decides who owes whom. [`service`] checks roles and keeps
//! mutations on one ledger serialized, and [`store`] persists snapshots.
//!
//! Callers are expected to have authenticated identities already; the
//! engine only checks that an identity holds the role an operation needs.

pub mod clock;
pub mod config;
pub mod ledger;
pub mod reconcile;
pub mod service;
pub mod store;

mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CliConfig, ContentionPolicy, ServiceConfig};
pub use error::{LedgerError, Result};
pub use ledger::{
    Amount, BankRef, BatteryBank, Identity, LedgerKey, LedgerSnapshot, Price, ProducerLedger,
    Timestamp, Transaction, TransactionType, TxRef,
};
pub use reconcile::{
    Reconciliation, ReconciliationEngine, Settlement, StatementLine, StatementReport,
};
pub use service::LedgerService;
pub use store::{JsonFileStore, LedgerStore, MemoryStore};
