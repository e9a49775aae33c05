//! Common test utilities for matching-service integration tests.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use http_body_util::BodyExt;
use matching_service::config::MatchingConfig;
use matching_service::models::{Receipt, Transaction};
use matching_service::services::{InMemoryMatchStore, MatchStore, PgMatchStore};
use matching_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::{Arc, Once};
use tower::ServiceExt;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,matching_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

pub fn dollars(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// In-memory application driven through `tower::ServiceExt::oneshot`.
#[allow(dead_code)]
pub struct TestApp {
    pub router: Router,
    pub store: Arc<dyn MatchStore>,
    pub state: AppState,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn receipt(&self, vendor: Option<&str>, day: u32, cents: i64) -> Receipt {
        self.store
            .insert_receipt(Receipt::new(vendor, Some(date(day)), Some(dollars(cents))))
            .await
            .unwrap()
    }

    pub async fn transaction(&self, description: &str, day: u32, cents: i64) -> Transaction {
        self.store
            .insert_transaction(Transaction::new(date(day), dollars(cents), description))
            .await
            .unwrap()
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, None).await
    }
}

fn app_for(config: MatchingConfig, store: Arc<dyn MatchStore>) -> TestApp {
    let state = AppState::new(config, store.clone());
    TestApp {
        router: build_router(state.clone()),
        store,
        state,
    }
}

/// Application over a fresh in-memory store.
pub fn spawn_app() -> TestApp {
    init_tracing();
    app_for(
        MatchingConfig::in_memory(),
        Arc::new(InMemoryMatchStore::new()),
    )
}

/// Application over Postgres at `TEST_DATABASE_URL`, with migrations applied.
#[allow(dead_code)]
pub async fn spawn_pg_app() -> TestApp {
    init_tracing();
    let url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run Postgres tests");

    let store = PgMatchStore::new(&url, 2, 1)
        .await
        .expect("Failed to connect to test database");
    store
        .run_migrations()
        .await
        .expect("Failed to run migrations");

    app_for(MatchingConfig::in_memory(), Arc::new(store))
}
