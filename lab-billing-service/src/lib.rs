//! Lab billing ledger: records, invoices, payments and the finalization lock.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
