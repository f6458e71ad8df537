//! mvcore - a multi-version storage and transaction core with
//! snapshot-isolated tables.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             mvcore                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │        Transaction Layer (txn/)                           │   │
//! │  │   Conglomerate + Transaction + constraint checks          │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │             ↓                    ↓                    ↓          │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐     │
//! │  │ Tables (table/)│  │ Locking (lock/)│  │ Exprs (expr/)  │     │
//! │  │ MasterTable    │  │ LockingQueue   │  │ stack machine  │     │
//! │  │ TableJournal   │  │ FIFO + cancel  │  │ + registry     │     │
//! │  └────────────────┘  └────────────────┘  └────────────────┘     │
//! │             ↓                                                    │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │        Index Layer (index/)                               │   │
//! │  │   IndexSetStore: versioned block lists, COW snapshots     │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │             ↓                                                    │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │        Store Layer (store/, blob/)                        │   │
//! │  │   FileStore / HeapStore areas + BlobStore refs            │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │             ↓                                                    │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │        Buffer Layer (buffer/)                             │   │
//! │  │   paged cache + redo journal + checkpoint/recovery        │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (ids, errors, config, values)
//! - [`store`] - Area-based persistent stores and the write latch
//! - [`buffer`] - Paged caching with journaled checkpoints
//! - [`blob`] - Out-of-line large-object storage
//! - [`index`] - Versioned, snapshot-capable sorted integer lists
//! - [`table`] - Master tables, row records, journals, mutable views
//! - [`lock`] - The per-table fair FIFO locking queue
//! - [`txn`] - The conglomerate, transactions, constraint checking
//! - [`expr`] - The row-level expression evaluator
//!
//! # Quick Start
//! ```no_run
//! use mvcore::common::{DbConfig, Value, ValueType};
//! use mvcore::table::{ColumnDefinition, TableDefinition};
//! use mvcore::txn::Conglomerate;
//!
//! let cong = Conglomerate::create(DbConfig::heap()).unwrap();
//! let def = TableDefinition::new(
//!     "person",
//!     vec![
//!         ColumnDefinition::new("id", ValueType::Integer).sorted_index(),
//!         ColumnDefinition::new("name", ValueType::Text),
//!     ],
//! )
//! .unwrap();
//! cong.create_table(def).unwrap();
//!
//! let mut txn = cong.begin();
//! txn.insert("person", &[Value::Integer(1), Value::Text("a".into())])
//!     .unwrap();
//! txn.commit().unwrap();
//! ```

// Core modules
pub mod blob;
pub mod buffer;
pub mod common;
pub mod expr;
pub mod index;
pub mod lock;
pub mod store;
pub mod table;
pub mod txn;

// Re-export commonly used items at crate root for convenience
pub use common::{AreaId, CommitId, DbConfig, Error, Result, RowId, StorageSystem, TableId, Value, ValueType};

pub use blob::{BlobRef, BlobStore};
pub use buffer::{BufferManager, BufferStats};
pub use expr::{Evaluator, Expression, FunctionRegistry, Operator};
pub use index::{IndexSet, IndexSetStore};
pub use lock::{CancelToken, LockType, LockingQueue};
pub use store::{FileStore, HeapStore, Store};
pub use table::{ColumnDefinition, MasterTable, RowState, TableDefinition, TableJournal};
pub use txn::{Conglomerate, Transaction, DATABASE_VERSION};
