//! Services module for lab-billing-service.

pub mod catalog;
pub mod database;
pub mod events;
pub mod finalization;
pub mod images;
pub mod invoice_builder;
pub(crate) mod invoice_rows;
pub mod metrics;
pub mod numbering;
pub mod payment_ledger;
pub mod recalculation;
pub mod record_store;
pub mod totals;

use std::sync::Arc;

pub use database::Database;
pub use events::{EventDispatcher, RecordTestChange, RecordTestEvent, RecordTestListener};
pub use images::{ImageStore, NoopImageStore};
pub use invoice_builder::InvoiceBuilder;
pub use metrics::{get_metrics, init_metrics};
pub use numbering::DEFAULT_ALLOCATION_ATTEMPTS;
pub use payment_ledger::PaymentLedger;
pub use recalculation::RecalculationEngine;
pub use record_store::RecordStore;

/// Tunables shared by the ledger components.
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    pub number_allocation_attempts: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            number_allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }
}

/// The billing ledger components wired to one database.
///
/// The recalculation engine is subscribed to the record store's test events,
/// so edits to invoiced records re-derive their invoice in the same
/// transaction.
#[derive(Clone)]
pub struct BillingServices {
    pub records: Arc<RecordStore>,
    pub invoices: Arc<InvoiceBuilder>,
    pub payments: Arc<PaymentLedger>,
    pub recalculation: Arc<RecalculationEngine>,
}

impl BillingServices {
    pub fn new(db: Arc<Database>, images: Arc<dyn ImageStore>, settings: LedgerSettings) -> Self {
        let recalculation = Arc::new(RecalculationEngine::new(db.clone()));

        let mut events = EventDispatcher::new();
        events.subscribe(recalculation.clone());

        let records = Arc::new(RecordStore::new(
            db.clone(),
            events,
            images.clone(),
            settings.number_allocation_attempts,
        ));
        let invoices = Arc::new(InvoiceBuilder::new(
            db.clone(),
            settings.number_allocation_attempts,
        ));
        let payments = Arc::new(PaymentLedger::new(db, images));

        Self {
            records,
            invoices,
            payments,
            recalculation,
        }
    }
}
