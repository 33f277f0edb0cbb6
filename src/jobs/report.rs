//! `generate-report`: summarise a company's bookings for a period and store
//! the summary as a JSON artifact.

use crate::error::{JobError, JobResult};
use crate::schema::{FieldSpec, PayloadSchema};
use crate::task::{ExecutionContext, TaskExecutor, parse_payload};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Task identifier
pub const TASK_ID: &str = "generate-report";

/// Reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl ReportPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Length of the window ending now.
    pub fn window(&self) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
            Self::Monthly => Duration::days(30),
        }
    }
}

/// A booking as seen by reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub company_id: String,
    pub booked_at: DateTime<Utc>,
    /// Price in cents
    pub price_cents: i64,
}

/// Read access to tenant data.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Bookings of `company_id` made at or after `since`.
    async fn bookings_since(&self, company_id: &str, since: DateTime<Utc>) -> JobResult<Vec<Booking>>;
}

/// Tenant-keyed in-memory data store for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    bookings: RwLock<HashMap<String, Vec<Booking>>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking: Booking) {
        self.bookings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(booking.company_id.clone())
            .or_default()
            .push(booking);
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn bookings_since(&self, company_id: &str, since: DateTime<Utc>) -> JobResult<Vec<Booking>> {
        let map = self.bookings.read().unwrap_or_else(PoisonError::into_inner);

        Ok(map
            .get(company_id)
            .map(|bookings| {
                bookings
                    .iter()
                    .filter(|b| b.booked_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Where generated artifacts are kept.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL for it.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> JobResult<String>;
}

/// Artifact store writing files below a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> JobResult<String> {
        let relative = Path::new(key);
        if key.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(JobError::fatal(format!(
                "Artifact key '{key}' must be a relative path without '..'"
            )));
        }

        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::transient_from("Cannot create artifact directory", e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| JobError::transient_from("Cannot write artifact", e))?;

        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Artifact store for tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> JobResult<String> {
        self.artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        Ok(format!("memory://{key}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportPayload {
    company_id: String,
    period: ReportPeriod,
}

/// Payload schema of `generate-report`.
pub fn schema() -> PayloadSchema {
    PayloadSchema::new()
        .field("companyId", FieldSpec::string().min_length(1).path_segment())
        .field(
            "period",
            FieldSpec::string().one_of(["daily", "weekly", "monthly"]),
        )
}

/// Executor of `generate-report`.
pub struct GenerateReport {
    data: Arc<dyn DataStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl GenerateReport {
    pub fn new(data: Arc<dyn DataStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { data, artifacts }
    }
}

#[async_trait]
impl TaskExecutor for GenerateReport {
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> JobResult<serde_json::Value> {
        let payload: ReportPayload = parse_payload(&ctx.task_id, payload)?;
        let generated_at = Utc::now();
        let since = generated_at - payload.period.window();

        let bookings = self.data.bookings_since(&payload.company_id, since).await?;
        let revenue_cents: i64 = bookings.iter().map(|b| b.price_cents).sum();
        let revenue = revenue_cents as f64 / 100.0;

        let summary = json!({
            "companyId": payload.company_id,
            "period": payload.period.as_str(),
            "from": since,
            "to": generated_at,
            "bookings": bookings.len(),
            "revenue": revenue,
            "generatedAt": generated_at,
        });

        let key = format!(
            "reports/{}/{}-{}.json",
            payload.company_id,
            payload.period.as_str(),
            generated_at.format("%Y%m%dT%H%M%S")
        );
        let url = self
            .artifacts
            .put(&key, serde_json::to_vec_pretty(&summary)?)
            .await?;

        tracing::debug!(
            company_id = %payload.company_id,
            period = payload.period.as_str(),
            bookings = bookings.len(),
            %url,
            "Report generated"
        );

        Ok(json!({
            "success": true,
            "companyId": payload.company_id,
            "period": payload.period.as_str(),
            "bookings": bookings.len(),
            "revenue": revenue,
            "url": url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            invocation_id: "inv-1".to_string(),
            task_id: TASK_ID.to_string(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    fn booking(id: &str, company: &str, age: Duration, price_cents: i64) -> Booking {
        Booking {
            id: id.to_string(),
            company_id: company.to_string(),
            booked_at: Utc::now() - age,
            price_cents,
        }
    }

    #[tokio::test]
    async fn test_summarises_only_the_company_and_window() {
        let data = Arc::new(MemoryDataStore::new());
        data.insert(booking("b1", "c1", Duration::hours(2), 12_050));
        data.insert(booking("b2", "c1", Duration::hours(30), 9_900));
        data.insert(booking("b3", "c2", Duration::hours(1), 50_000));
        let artifacts = Arc::new(MemoryArtifactStore::new());

        let executor = GenerateReport::new(data, artifacts.clone());
        let result = assert_ok!(
            executor
                .execute(json!({"companyId": "c1", "period": "daily"}), ctx())
                .await
        );

        assert_eq!(result["success"], true);
        assert_eq!(result["bookings"], 1);
        assert_eq!(result["revenue"], 120.5);

        let url = result["url"].as_str().unwrap();
        let key = url.strip_prefix("memory://").unwrap();
        assert!(key.starts_with("reports/c1/daily-"));
        let stored: serde_json::Value = serde_json::from_slice(&artifacts.get(key).unwrap()).unwrap();
        assert_eq!(stored["bookings"], 1);
        assert_eq!(stored["companyId"], "c1");
    }

    #[tokio::test]
    async fn test_weekly_window_includes_older_bookings() {
        let data = Arc::new(MemoryDataStore::new());
        data.insert(booking("b1", "c1", Duration::hours(2), 100));
        data.insert(booking("b2", "c1", Duration::days(3), 200));
        data.insert(booking("b3", "c1", Duration::days(10), 400));

        let executor = GenerateReport::new(data, Arc::new(MemoryArtifactStore::new()));
        let result = assert_ok!(
            executor
                .execute(json!({"companyId": "c1", "period": "weekly"}), ctx())
                .await
        );
        assert_eq!(result["bookings"], 2);
        assert_eq!(result["revenue"], 3.0);
    }

    #[tokio::test]
    async fn test_fs_store_writes_file() {
        let root = std::env::temp_dir().join(format!("jobsmith-artifacts-{}", uuid::Uuid::new_v4()));
        let store = FsArtifactStore::new(&root);

        let url = assert_ok!(store.put("reports/c1/a.json", b"{}".to_vec()).await);
        assert!(url.starts_with("file://"));
        assert_eq!(
            tokio::fs::read(root.join("reports/c1/a.json")).await.unwrap(),
            b"{}".to_vec()
        );

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_refuses_keys_leaving_root() {
        let root = std::env::temp_dir().join(format!("jobsmith-artifacts-{}", uuid::Uuid::new_v4()));
        let store = FsArtifactStore::new(root.join("inner"));

        for key in ["../escaped/a.json", "reports/c1/../../../x.json", "/tmp/abs.json", "./a.json", ""] {
            let err = store.put(key, b"{}".to_vec()).await.unwrap_err();
            assert!(!err.is_retryable(), "{key:?} should be refused");
        }
        assert!(!root.join("escaped").exists());
    }

    #[test]
    fn test_schema_rejects_company_path_traversal() {
        for company in ["../../escaped", "c1/../c2", "..", "c1\\c2"] {
            let err = schema()
                .validate(TASK_ID, &json!({"companyId": company, "period": "daily"}))
                .unwrap_err();
            let JobError::Validation { violations, .. } = err else {
                panic!("expected validation error");
            };
            assert_eq!(violations[0].field, "companyId");
        }
    }

    #[test]
    fn test_insert_survives_poisoned_lock() {
        let data = Arc::new(MemoryDataStore::new());
        let poisoner = Arc::clone(&data);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.bookings.write().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(data.bookings.is_poisoned());

        data.insert(booking("b1", "c1", Duration::hours(1), 100));
        let stored = data.bookings.read().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(stored["c1"].len(), 1);
    }

    #[test]
    fn test_schema_requires_company_and_period() {
        let err = schema().validate(TASK_ID, &json!({"period": "yearly"})).unwrap_err();
        let JobError::Validation { violations, .. } = err else {
            panic!("expected validation error");
        };
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"companyId"));
        assert!(fields.contains(&"period"));
    }
}
