//! Domain models for lab-billing-service.

mod catalog;
mod invoice;
mod payment;
mod record;
mod sample;

pub use catalog::{CatalogTest, Standard};
pub use invoice::{
    CreateInvoice, Invoice, InvoiceAdjustment, InvoiceChange, InvoiceDetails, InvoicePredicate,
    InvoiceRecord, InvoicedRecord, PaymentState, UpdateInvoice,
};
pub use payment::{CreatePayment, Payment, UpdatePayment};
pub use record::{CreateRecord, EditSource, Record, RecordDetails, RecordPredicate, RecordState};
pub use record_test::{NewRecordTest, RecordTest, RecordTestState, UpdateRecordTest};
pub use sample::{NewSample, Sample, UpdateSample};

use rust_decimal::Decimal;
use uuid::Uuid;
use validator::ValidationError;

/// Keyset page request shared by list operations.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page_size: 50,
            page_token: None,
        }
    }
}

impl PageRequest {
    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, 100) as i64
    }
}

/// Largest magnitude a stored money column (NUMERIC(14, 2)) can hold.
pub fn max_amount() -> Decimal {
    Decimal::new(99_999_999_999_999, 2)
}

pub(crate) fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        return Err(ValidationError::new("negative_amount"));
    }
    if *value > max_amount() {
        return Err(ValidationError::new("amount_out_of_range"));
    }
    Ok(())
}

pub(crate) fn validate_positive(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        return Err(ValidationError::new("non_positive_amount"));
    }
    if *value > max_amount() {
        return Err(ValidationError::new("amount_out_of_range"));
    }
    Ok(())
}

pub(crate) fn validate_percentage(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || *value > Decimal::ONE_HUNDRED {
        return Err(ValidationError::new("percentage_out_of_range"));
    }
    Ok(())
}

/// Image references are opaque URLs owned by the upload service.
pub(crate) fn validate_image_urls(urls: &[String]) -> Result<(), ValidationError> {
    if urls.iter().any(|u| u.trim().is_empty() || u.len() > 2048) {
        return Err(ValidationError::new("invalid_image_url"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_validators() {
        assert!(validate_non_negative(&Decimal::ZERO).is_ok());
        assert!(validate_non_negative(&Decimal::new(-1, 2)).is_err());
        assert!(validate_positive(&Decimal::ZERO).is_err());
        assert!(validate_positive(&Decimal::new(1, 2)).is_ok());
        assert!(validate_non_negative(&max_amount()).is_ok());
        assert!(validate_non_negative(&Decimal::MAX).is_err());
        assert!(validate_positive(&(max_amount() + Decimal::new(1, 2))).is_err());
        assert!(validate_percentage(&Decimal::ONE_HUNDRED).is_ok());
        assert!(validate_percentage(&Decimal::new(10001, 2)).is_err());
    }

    #[test]
    fn page_size_is_clamped() {
        let page = PageRequest {
            page_size: 500,
            page_token: None,
        };
        assert_eq!(page.limit(), 100);
        assert_eq!(PageRequest { page_size: 0, page_token: None }.limit(), 1);
    }

    #[test]
    fn create_payment_rejects_zero_amount() {
        use validator::Validate;

        let input = CreatePayment {
            invoice_id: Uuid::new_v4(),
            amount: Decimal::ZERO,
            payment_method: "cash".to_string(),
            reference: None,
            image_urls: vec![],
            payment_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            notes: None,
        };
        assert!(input.validate().is_err());
    }
}
