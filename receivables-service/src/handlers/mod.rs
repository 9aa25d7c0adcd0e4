//! HTTP handlers for receivables-service.

pub mod customers;
pub mod health;
pub mod inventory;
pub mod ledger;
pub mod onboarding;
pub mod settlements;
