//! Test helper module for lab-billing-service integration tests.
//!
//! Every test gets its own PostgreSQL schema. Tests are skipped when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use lab_billing_service::config::{DatabaseConfig, LabBillingConfig, LedgerConfig};
use lab_billing_service::models::{
    CreateInvoice, CreatePayment, CreateRecord, NewRecordTest, NewSample, RecordDetails,
    RecordState,
};
use lab_billing_service::services::{BillingServices, Database, ImageStore};
use lab_billing_service::startup::Application;
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for tests, if configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_lab_billing_{}_{}", std::process::id(), counter)
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Image store that remembers what it was asked to remove.
#[derive(Default)]
pub struct RecordingImageStore {
    removed: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingImageStore {
    pub fn failing() -> Self {
        Self {
            removed: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageStore for RecordingImageStore {
    async fn remove(&self, url: &str) -> Result<(), AppError> {
        self.removed.lock().unwrap().push(url.to_string());
        if self.fail {
            return Err(AppError::ServiceUnavailable);
        }
        Ok(())
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub db: Arc<Database>,
    pub services: BillingServices,
    pub images: Arc<RecordingImageStore>,
    pub customer_id: Uuid,
    schema_name: String,
    base_url: String,
}

impl TestApp {
    /// Spawn a test application on a random port, or `None` when no test
    /// database is configured.
    pub async fn spawn() -> Option<Self> {
        Self::spawn_with(Arc::new(RecordingImageStore::default())).await
    }

    pub async fn spawn_with(images: Arc<RecordingImageStore>) -> Option<Self> {
        let Some(base_url) = get_test_database_url() else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return None;
        };
        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let config = LabBillingConfig {
            common: CoreConfig {
                port: 0,
                bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
            service_name: "lab-billing-service-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: db_url_with_schema,
                max_connections: 5,
                min_connections: 1,
            },
            ledger: LedgerConfig {
                number_allocation_attempts: 5,
            },
        };

        let app = Application::build_with(config, images.clone())
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let db = app.db();
        let services = app.services().clone();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", http_port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        Some(TestApp {
            http_address: format!("http://127.0.0.1:{}", http_port),
            http_port,
            db,
            services,
            images,
            customer_id: Uuid::new_v4(),
            schema_name,
            base_url,
        })
    }

    /// Add an orderable test to the catalog.
    pub async fn seed_test(&self, name: &str, price: &str) -> Uuid {
        let test_id = Uuid::new_v4();
        sqlx::query("INSERT INTO tests (test_id, name, base_price) VALUES ($1, $2, $3)")
            .bind(test_id)
            .bind(name)
            .bind(dec(price))
            .execute(self.db.pool())
            .await
            .expect("Failed to seed test");
        test_id
    }

    pub async fn seed_standard(&self, code: &str) -> Uuid {
        let standard_id = Uuid::new_v4();
        sqlx::query("INSERT INTO standards (standard_id, code, title) VALUES ($1, $2, $3)")
            .bind(standard_id)
            .bind(code)
            .bind(format!("Standard {}", code))
            .execute(self.db.pool())
            .await
            .expect("Failed to seed standard");
        standard_id
    }

    pub fn sample_for(&self, customer_id: Option<Uuid>, orderer_id: Option<Uuid>) -> NewSample {
        NewSample {
            customer_id,
            orderer_id,
            sample_name: "Soil core".to_string(),
            quantity: 1,
            condition: Some("sealed".to_string()),
            reception_notes: None,
            reception_date: day(2026, 3, 2),
            image_urls: vec![],
        }
    }

    /// Record for the default customer with one test per catalog id.
    pub async fn create_record(&self, test_ids: &[Uuid]) -> RecordDetails {
        self.create_record_for(Some(self.customer_id), None, test_ids)
            .await
    }

    pub async fn create_record_for(
        &self,
        customer_id: Option<Uuid>,
        orderer_id: Option<Uuid>,
        test_ids: &[Uuid],
    ) -> RecordDetails {
        let input = CreateRecord {
            sample: self.sample_for(customer_id, orderer_id),
            tests: test_ids.iter().map(|id| NewRecordTest::for_test(*id)).collect(),
        };
        self.services
            .records
            .create_record(&input)
            .await
            .expect("Failed to create record")
    }

    /// Record moved through the lab to `completed`.
    pub async fn completed_record(&self, test_ids: &[Uuid]) -> RecordDetails {
        let details = self.create_record(test_ids).await;
        self.services
            .records
            .update_record_state(details.record.record_id, RecordState::Completed)
            .await
            .expect("Failed to complete record");
        details
    }

    pub fn invoice_input(&self, record_ids: Vec<Uuid>, tax_rate: &str) -> CreateInvoice {
        CreateInvoice {
            record_ids,
            tax_rate: dec(tax_rate),
            discount_amount: Decimal::ZERO,
            additional_charges: Decimal::ZERO,
            issue_date: None,
            due_date: None,
            notes: None,
        }
    }

    pub fn payment_input(&self, invoice_id: Uuid, amount: &str) -> CreatePayment {
        CreatePayment {
            invoice_id,
            amount: dec(amount),
            payment_method: "bank_transfer".to_string(),
            reference: None,
            image_urls: vec![],
            payment_date: day(2026, 3, 10),
            notes: None,
        }
    }

    /// Σ payments straight from the table.
    pub async fn payments_sum(&self, invoice_id: Uuid) -> Decimal {
        sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0) FROM payments WHERE invoice_id = $1")
            .bind(invoice_id)
            .fetch_one(self.db.pool())
            .await
            .unwrap()
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        self.db.close().await;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
