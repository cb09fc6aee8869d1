//! Money arithmetic shared by invoicing, payments and recalculation.
//!
//! Every amount is rounded to two decimal places before it is persisted, so
//! the identities checked by the schema hold exactly:
//!
//! - `final_price = test_price + additional_charges - discount`
//! - `total_amount = subtotal + tax_amount + additional_charges - discount_amount`
//! - `amount_remaining = total_amount - amount_paid`

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{max_amount, PaymentState};

/// Scale of every stored monetary column.
pub const MONEY_SCALE: u32 = 2;

/// Scale of the stored tax rate.
pub const RATE_SCALE: u32 = 4;

/// Round to the stored money scale.
pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to the stored tax rate scale.
pub fn rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whether `value` fits a stored money column.
pub fn fits_money_column(value: Decimal) -> bool {
    value.abs() <= max_amount()
}

/// Price of a single record test.
pub fn final_price(test_price: Decimal, additional_charges: Decimal, discount: Decimal) -> Decimal {
    money(test_price) + money(additional_charges) - money(discount)
}

/// Invoice-level amounts derived from the subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub additional_charges: Decimal,
    pub total_amount: Decimal,
}

impl InvoiceTotals {
    /// `tax_rate` is a percentage. It is rounded to the stored scale before
    /// tax is derived, so recomputing from the stored row is stable.
    pub fn compute(
        subtotal: Decimal,
        tax_rate: Decimal,
        discount_amount: Decimal,
        additional_charges: Decimal,
    ) -> Self {
        let subtotal = money(subtotal);
        let discount_amount = money(discount_amount);
        let additional_charges = money(additional_charges);
        let tax_rate = rate(tax_rate);
        let tax_amount = money(subtotal * tax_rate / Decimal::ONE_HUNDRED);
        let total_amount = subtotal + tax_amount + additional_charges - discount_amount;

        Self {
            subtotal,
            tax_rate,
            tax_amount,
            discount_amount,
            additional_charges,
            total_amount,
        }
    }

    pub fn fits_columns(&self) -> bool {
        [
            self.subtotal,
            self.tax_amount,
            self.discount_amount,
            self.additional_charges,
            self.total_amount,
        ]
        .into_iter()
        .all(fits_money_column)
    }
}

/// Collection status derived from what has been paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub amount_paid: Decimal,
    pub amount_remaining: Decimal,
    pub payment_state: PaymentState,
    pub payment_date: Option<NaiveDate>,
}

impl Settlement {
    /// A freshly issued invoice: nothing paid, always `pending`.
    pub fn opening(total_amount: Decimal) -> Self {
        Self {
            amount_paid: Decimal::ZERO,
            amount_remaining: total_amount,
            payment_state: PaymentState::Pending,
            payment_date: None,
        }
    }

    /// Derive paid/remaining/state for `total_amount` and `amount_paid`.
    ///
    /// `current` only matters when it is a manual override: `cancelled` is
    /// kept unconditionally, `overdue` until the balance is cleared.
    /// `payment_date` keeps an existing stamp while fully paid and is
    /// stamped with `today` when the balance is first cleared.
    pub fn derive(
        total_amount: Decimal,
        amount_paid: Decimal,
        current: PaymentState,
        payment_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Self {
        let amount_paid = money(amount_paid);
        let amount_remaining = total_amount - amount_paid;
        let settled = amount_remaining <= Decimal::ZERO;

        let payment_state = match current {
            PaymentState::Cancelled => PaymentState::Cancelled,
            PaymentState::Overdue if !settled => PaymentState::Overdue,
            _ if settled => PaymentState::Paid,
            _ if amount_paid > Decimal::ZERO => PaymentState::Partial,
            _ => PaymentState::Pending,
        };

        let payment_date = if settled && amount_paid > Decimal::ZERO {
            payment_date.or(Some(today))
        } else {
            None
        };

        Self {
            amount_paid,
            amount_remaining,
            payment_state,
            payment_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn final_price_adds_charges_and_subtracts_discount() {
        assert_eq!(final_price(dec("100"), dec("20"), dec("5")), dec("115"));
        assert_eq!(final_price(dec("10.005"), dec("0"), dec("0")), dec("10.01"));
    }

    #[test]
    fn invoice_totals_for_two_tests_at_ten_percent() {
        let totals = InvoiceTotals::compute(dec("150"), dec("10"), dec("0"), dec("0"));
        assert_eq!(totals.subtotal, dec("150"));
        assert_eq!(totals.tax_amount, dec("15"));
        assert_eq!(totals.total_amount, dec("165"));
    }

    #[test]
    fn total_identity_holds_after_rounding() {
        let totals = InvoiceTotals::compute(dec("33.33"), dec("9"), dec("1.10"), dec("2.25"));
        assert_eq!(totals.tax_amount, dec("3.00"));
        assert_eq!(
            totals.total_amount,
            totals.subtotal + totals.tax_amount + totals.additional_charges
                - totals.discount_amount
        );
    }

    #[test]
    fn tax_rate_is_rounded_to_stored_scale_before_tax() {
        let created = InvoiceTotals::compute(dec("100000"), dec("9.99999"), dec("0"), dec("0"));
        assert_eq!(created.tax_rate, dec("10.0000"));
        assert_eq!(created.tax_amount, dec("10000.00"));

        let recomputed =
            InvoiceTotals::compute(created.subtotal, created.tax_rate, dec("0"), dec("0"));
        assert_eq!(recomputed, created);
    }

    #[test]
    fn totals_beyond_money_columns_do_not_fit() {
        let max = max_amount();
        assert!(fits_money_column(max));
        assert!(fits_money_column(-max));
        assert!(!fits_money_column(max + dec("0.01")));

        let fitting = InvoiceTotals::compute(dec("100"), dec("10"), dec("0"), dec("0"));
        assert!(fitting.fits_columns());
        let overflowing = InvoiceTotals::compute(max, dec("10"), dec("0"), dec("0"));
        assert!(!overflowing.fits_columns());
    }

    #[test]
    fn settlement_states_follow_amounts() {
        let pending = Settlement::derive(dec("165"), dec("0"), PaymentState::Pending, None, day());
        assert_eq!(pending.payment_state, PaymentState::Pending);
        assert_eq!(pending.amount_remaining, dec("165"));
        assert_eq!(pending.payment_date, None);

        let partial = Settlement::derive(dec("165"), dec("65"), PaymentState::Pending, None, day());
        assert_eq!(partial.payment_state, PaymentState::Partial);
        assert_eq!(partial.amount_remaining, dec("100"));

        let paid = Settlement::derive(dec("165"), dec("165"), PaymentState::Partial, None, day());
        assert_eq!(paid.payment_state, PaymentState::Paid);
        assert_eq!(paid.amount_remaining, Decimal::ZERO);
        assert_eq!(paid.payment_date, Some(day()));
    }

    #[test]
    fn opening_settlement_is_pending_even_for_zero_total() {
        let opening = Settlement::opening(Decimal::ZERO);
        assert_eq!(opening.payment_state, PaymentState::Pending);
        assert_eq!(opening.amount_remaining, Decimal::ZERO);

        let recalculated =
            Settlement::derive(Decimal::ZERO, Decimal::ZERO, PaymentState::Pending, None, day());
        assert_eq!(recalculated.payment_state, PaymentState::Paid);
        assert_eq!(recalculated.payment_date, None);
    }

    #[test]
    fn settlement_keeps_existing_payment_date() {
        let earlier = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let paid = Settlement::derive(
            dec("10"),
            dec("10"),
            PaymentState::Paid,
            Some(earlier),
            day(),
        );
        assert_eq!(paid.payment_date, Some(earlier));
    }

    #[test]
    fn settlement_drops_payment_date_when_balance_reopens() {
        let reopened = Settlement::derive(
            dec("185"),
            dec("165"),
            PaymentState::Paid,
            Some(day()),
            day(),
        );
        assert_eq!(reopened.payment_state, PaymentState::Partial);
        assert_eq!(reopened.amount_remaining, dec("20"));
        assert_eq!(reopened.payment_date, None);
    }

    #[test]
    fn manual_overrides_survive_recomputation() {
        let cancelled =
            Settlement::derive(dec("100"), dec("100"), PaymentState::Cancelled, None, day());
        assert_eq!(cancelled.payment_state, PaymentState::Cancelled);

        let overdue = Settlement::derive(dec("100"), dec("40"), PaymentState::Overdue, None, day());
        assert_eq!(overdue.payment_state, PaymentState::Overdue);

        let cleared =
            Settlement::derive(dec("100"), dec("100"), PaymentState::Overdue, None, day());
        assert_eq!(cleared.payment_state, PaymentState::Paid);
    }

    #[test]
    fn incremental_and_resummed_paths_agree() {
        let payments = [dec("40"), dec("25.50"), dec("99.50")];
        let mut state = PaymentState::Pending;
        let mut date = None;
        let mut paid = Decimal::ZERO;
        for amount in payments {
            paid += amount;
            let step = Settlement::derive(dec("165"), paid, state, date, day());
            state = step.payment_state;
            date = step.payment_date;
        }
        let resummed = Settlement::derive(
            dec("165"),
            payments.iter().copied().sum(),
            PaymentState::Pending,
            None,
            day(),
        );
        assert_eq!(state, resummed.payment_state);
        assert_eq!(date, resummed.payment_date);
        assert_eq!(paid, resummed.amount_paid);
    }
}
