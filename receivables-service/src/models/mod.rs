//! Domain models for receivables-service.

mod baseline;
mod catalog;
mod customer;
mod cylinder;
mod sale;
mod settlement;
mod snapshot;

pub use baseline::{BaselineSource, DriverCylinderBaseline, OnboardingSeed};
pub use catalog::ProductStock;
pub use customer::{
    CustomerAggregation, CustomerReceivable, CustomerReceivableFilter, ReceivableStatus,
    ReceivableType,
};
pub use cylinder::CylinderSize;
pub use sale::{InventoryMovement, MovementKind, SaleRecord, SaleType};
pub use settlement::{PaymentType, Settlement, SettlementLine, SettlementTotals};
pub use snapshot::{
    InventoryReceivable, InventoryReceivableDelta, LedgerKey, ReceivableRecord, SnapshotUpsert,
    SnapshotWrite,
};
