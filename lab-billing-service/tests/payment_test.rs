//! Payment ledger integration tests.

mod common;

use common::{dec, day, RecordingImageStore, TestApp};
use lab_billing_service::models::{
    Invoice, InvoiceAdjustment, InvoiceChange, PaymentState, UpdateInvoice, UpdatePayment,
};
use rust_decimal::Decimal;
use service_core::error::ErrorKind;
use std::sync::Arc;
use uuid::Uuid;

/// Invoice of 100 + 50 at 10% tax: total 165.
async fn invoice_of_165(app: &TestApp) -> Invoice {
    let ph = app.seed_test("pH", "100").await;
    let moisture = app.seed_test("Moisture", "50").await;
    let record = app.completed_record(&[ph, moisture]).await;
    app.services
        .invoices
        .create_invoice(&app.invoice_input(vec![record.record.record_id], "10"))
        .await
        .unwrap()
}

async fn reload(app: &TestApp, invoice_id: Uuid) -> Invoice {
    app.services
        .invoices
        .get_invoice_by_id(invoice_id)
        .await
        .unwrap()
        .unwrap()
        .invoice
}

#[tokio::test]
async fn full_payment_settles_invoice() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;

    let payment = app
        .services
        .payments
        .add_payment(&app.payment_input(invoice.invoice_id, "165"))
        .await
        .unwrap();
    assert_eq!(payment.amount, dec("165"));
    assert_eq!(payment.payment_method, "bank_transfer");

    let invoice = reload(&app, invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec("165"));
    assert_eq!(invoice.amount_remaining, Decimal::ZERO);
    assert_eq!(invoice.payment_state(), PaymentState::Paid);
    assert!(invoice.payment_date.is_some());

    app.cleanup().await;
}

#[tokio::test]
async fn overpayment_is_rejected_without_side_effects() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;

    let err = app
        .services
        .payments
        .add_payment(&app.payment_input(invoice.invoice_id, "200"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let reloaded = reload(&app, invoice.invoice_id).await;
    assert_eq!(reloaded.amount_paid, Decimal::ZERO);
    assert_eq!(reloaded.payment_state(), PaymentState::Pending);
    assert!(app
        .services
        .payments
        .list_payments_by_invoice(invoice.invoice_id)
        .await
        .unwrap()
        .is_empty());

    app.cleanup().await;
}

#[tokio::test]
async fn partial_payments_accumulate() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    payments
        .add_payment(&app.payment_input(invoice.invoice_id, "65"))
        .await
        .unwrap();
    let partial = reload(&app, invoice.invoice_id).await;
    assert_eq!(partial.payment_state(), PaymentState::Partial);
    assert_eq!(partial.amount_remaining, dec("100"));
    assert_eq!(partial.payment_date, None);

    let mut second = app.payment_input(invoice.invoice_id, "100");
    second.payment_method = "cash".to_string();
    second.payment_date = day(2026, 3, 12);
    payments.add_payment(&second).await.unwrap();

    let paid = reload(&app, invoice.invoice_id).await;
    assert_eq!(paid.payment_state(), PaymentState::Paid);
    assert_eq!(paid.amount_paid, app.payments_sum(invoice.invoice_id).await);

    let listed = payments
        .list_payments_by_invoice(invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].amount, dec("65"));
    assert_eq!(listed[1].payment_method, "cash");

    app.cleanup().await;
}

#[tokio::test]
async fn add_payment_validates_input() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    let err = payments
        .add_payment(&app.payment_input(invoice.invoice_id, "0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut blank = app.payment_input(invoice.invoice_id, "10");
    blank.payment_method = "   ".to_string();
    let err = payments.add_payment(&blank).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = payments
        .add_payment(&app.payment_input(Uuid::new_v4(), "10"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = payments
        .list_payments_by_invoice(Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    app.cleanup().await;
}

#[tokio::test]
async fn cancelled_invoice_refuses_payments() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    app.services
        .invoices
        .update_invoice(
            invoice.invoice_id,
            &UpdateInvoice {
                change: InvoiceChange::Adjust(InvoiceAdjustment {
                    payment_state: Some(PaymentState::Cancelled),
                    ..Default::default()
                }),
                allow_paid_override: false,
            },
        )
        .await
        .unwrap();

    let err = app
        .services
        .payments
        .add_payment(&app.payment_input(invoice.invoice_id, "10"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(app.payments_sum(invoice.invoice_id).await, Decimal::ZERO);

    app.cleanup().await;
}

#[tokio::test]
async fn update_payment_resums_invoice() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    payments
        .add_payment(&app.payment_input(invoice.invoice_id, "100"))
        .await
        .unwrap();
    let second = payments
        .add_payment(&app.payment_input(invoice.invoice_id, "50"))
        .await
        .unwrap();

    let updated = payments
        .update_payment(
            second.payment_id,
            &UpdatePayment {
                amount: Some(dec("65")),
                reference: Some("TRX-0042".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.amount, dec("65"));
    assert_eq!(updated.reference.as_deref(), Some("TRX-0042"));
    assert_eq!(updated.payment_method, "bank_transfer");

    let paid = reload(&app, invoice.invoice_id).await;
    assert_eq!(paid.amount_paid, dec("165"));
    assert_eq!(paid.payment_state(), PaymentState::Paid);
    assert_eq!(paid.amount_paid, app.payments_sum(invoice.invoice_id).await);

    let lowered = payments
        .update_payment(
            second.payment_id,
            &UpdatePayment {
                amount: Some(dec("15")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(lowered.amount, dec("15"));
    let reopened = reload(&app, invoice.invoice_id).await;
    assert_eq!(reopened.payment_state(), PaymentState::Partial);
    assert_eq!(reopened.amount_remaining, dec("50"));
    assert_eq!(reopened.payment_date, None);

    app.cleanup().await;
}

#[tokio::test]
async fn update_payment_cannot_overpay() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    payments
        .add_payment(&app.payment_input(invoice.invoice_id, "100"))
        .await
        .unwrap();
    let second = payments
        .add_payment(&app.payment_input(invoice.invoice_id, "50"))
        .await
        .unwrap();

    let err = payments
        .update_payment(
            second.payment_id,
            &UpdatePayment {
                amount: Some(dec("100")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let unchanged = payments.get_payment(second.payment_id).await.unwrap().unwrap();
    assert_eq!(unchanged.amount, dec("50"));
    let reloaded = reload(&app, invoice.invoice_id).await;
    assert_eq!(reloaded.amount_paid, dec("150"));

    let err = payments
        .update_payment(Uuid::new_v4(), &UpdatePayment::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    app.cleanup().await;
}

#[tokio::test]
async fn delete_payment_resums_invoice() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    let first = payments
        .add_payment(&app.payment_input(invoice.invoice_id, "100"))
        .await
        .unwrap();
    let second = payments
        .add_payment(&app.payment_input(invoice.invoice_id, "65"))
        .await
        .unwrap();
    assert_eq!(
        reload(&app, invoice.invoice_id).await.payment_state(),
        PaymentState::Paid
    );

    payments.delete_payment(second.payment_id).await.unwrap();
    let partial = reload(&app, invoice.invoice_id).await;
    assert_eq!(partial.amount_paid, dec("100"));
    assert_eq!(partial.payment_state(), PaymentState::Partial);
    assert_eq!(partial.payment_date, None);

    payments.delete_payment(first.payment_id).await.unwrap();
    let pending = reload(&app, invoice.invoice_id).await;
    assert_eq!(pending.amount_paid, Decimal::ZERO);
    assert_eq!(pending.amount_remaining, dec("165"));
    assert_eq!(pending.payment_state(), PaymentState::Pending);

    let err = payments.delete_payment(first.payment_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    app.cleanup().await;
}

#[tokio::test]
async fn payment_images_are_released() {
    let images = Arc::new(RecordingImageStore::default());
    let Some(app) = TestApp::spawn_with(images.clone()).await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let payments = &app.services.payments;

    let mut input = app.payment_input(invoice.invoice_id, "65");
    input.image_urls = vec![
        "https://files.example/receipt-1.jpg".to_string(),
        "https://files.example/receipt-2.jpg".to_string(),
    ];
    let payment = payments.add_payment(&input).await.unwrap();

    payments
        .update_payment(
            payment.payment_id,
            &UpdatePayment {
                image_urls: Some(vec!["https://files.example/receipt-2.jpg".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        images.removed(),
        vec!["https://files.example/receipt-1.jpg".to_string()]
    );

    payments.delete_payment(payment.payment_id).await.unwrap();
    assert_eq!(
        images.removed(),
        vec![
            "https://files.example/receipt-1.jpg".to_string(),
            "https://files.example/receipt-2.jpg".to_string(),
        ]
    );

    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_payments_never_exceed_total() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let invoice = invoice_of_165(&app).await;
    let first = app.payment_input(invoice.invoice_id, "100");
    let second = app.payment_input(invoice.invoice_id, "100");

    let (a, b) = tokio::join!(
        app.services.payments.add_payment(&first),
        app.services.payments.add_payment(&second)
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let reloaded = reload(&app, invoice.invoice_id).await;
    assert_eq!(reloaded.amount_paid, dec("100"));
    assert_eq!(reloaded.amount_paid, app.payments_sum(invoice.invoice_id).await);

    app.cleanup().await;
}
