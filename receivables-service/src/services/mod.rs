pub mod allocator;
pub mod baseline;
pub mod calculator;
pub mod database;
pub mod debt_tracker;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod settlement;
pub mod store;

pub use baseline::{BaselineSeeder, DriverBaselines};
pub use database::Database;
pub use error::{ReceivablesError, ReceivablesResult};
pub use ledger::{LedgerService, RecomputeOutcome};
pub use memory::MemoryStore;
pub use self::metrics::{get_metrics, init_metrics};
pub use settlement::{SettlementResult, SettlementService};
pub use store::{ReceivablesStore, SettlementTx};
