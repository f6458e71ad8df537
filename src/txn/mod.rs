//! Transactions and the conglomerate commit machinery.

mod conglomerate;
mod constraints;
mod transaction;

pub use conglomerate::{Conglomerate, TableLock, DATABASE_VARS_TABLE, DATABASE_VERSION};
pub use transaction::Transaction;
