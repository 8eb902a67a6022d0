//! Router (session) rows.

use crate::error::Result;
use crate::store::Store;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

/// Router lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouterStatus {
    Active,
    Processing,
    Completed,
    Failed,
    Archived,
}

impl RouterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RouterStatus::Active => "active",
            RouterStatus::Processing => "processing",
            RouterStatus::Completed => "completed",
            RouterStatus::Failed => "failed",
            RouterStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RouterStatus::Active),
            "processing" => Some(RouterStatus::Processing),
            "completed" => Some(RouterStatus::Completed),
            "failed" => Some(RouterStatus::Failed),
            "archived" => Some(RouterStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored router session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRecord {
    pub router_id: String,
    pub status: RouterStatus,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub title: String,
    pub preview: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Store {
    pub async fn create_router(
        &self,
        router_id: &str,
        status: RouterStatus,
        model: &str,
        temperature: f64,
        title: &str,
        preview: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO routers (router_id, status, model, temperature, title, preview) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(router_id)
        .bind(status.as_str())
        .bind(model)
        .bind(temperature)
        .bind(title)
        .bind(preview)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to create router {router_id}"))?;

        Ok(())
    }

    pub async fn get_router(&self, router_id: &str) -> Result<Option<RouterRecord>> {
        let row = sqlx::query(
            "SELECT router_id, status, model, temperature, title, preview, created_at, updated_at \
             FROM routers WHERE router_id = ?",
        )
        .bind(router_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("failed to fetch router {router_id}"))?;

        row.map(router_from_row).transpose()
    }

    /// All routers, newest first.
    pub async fn list_routers(&self) -> Result<Vec<RouterRecord>> {
        let rows = sqlx::query(
            "SELECT router_id, status, model, temperature, title, preview, created_at, updated_at \
             FROM routers ORDER BY created_at DESC, router_id DESC",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to list routers")?;

        rows.into_iter().map(router_from_row).collect()
    }

    pub async fn update_router_status(&self, router_id: &str, status: RouterStatus) -> Result<()> {
        sqlx::query(
            "UPDATE routers SET status = ?, updated_at = datetime('now') WHERE router_id = ?",
        )
        .bind(status.as_str())
        .bind(router_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update router {router_id} status"))?;

        Ok(())
    }

    pub async fn update_router_title(&self, router_id: &str, title: &str) -> Result<()> {
        sqlx::query(
            "UPDATE routers SET title = ?, updated_at = datetime('now') WHERE router_id = ?",
        )
        .bind(title)
        .bind(router_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update router {router_id} title"))?;

        Ok(())
    }
}

fn router_from_row(row: sqlx::sqlite::SqliteRow) -> Result<RouterRecord> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read router status")?;
    let status = RouterStatus::parse(&status_value)
        .with_context(|| format!("invalid router status in database: {status_value}"))?;

    Ok(RouterRecord {
        router_id: row
            .try_get("router_id")
            .context("failed to read router_id")?,
        status,
        model: row.try_get("model").ok(),
        temperature: row.try_get("temperature").ok(),
        title: row.try_get("title").context("failed to read router title")?,
        preview: row
            .try_get("preview")
            .context("failed to read router preview")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read router created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(crate::store::timestamp_to_rfc3339)
            .context("failed to read router updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn router_lifecycle_round_trips() {
        let store = Store::connect_in_memory().await.expect("store");

        store
            .create_router("r1", RouterStatus::Active, "gpt-4.1-nano", 0.0, "Hello", "Hello")
            .await
            .expect("create");

        let router = store.get_router("r1").await.expect("fetch").expect("exists");
        assert_eq!(router.status, RouterStatus::Active);
        assert_eq!(router.title, "Hello");

        store
            .update_router_status("r1", RouterStatus::Processing)
            .await
            .expect("update");
        let router = store.get_router("r1").await.expect("fetch").expect("exists");
        assert_eq!(router.status, RouterStatus::Processing);

        assert!(store.get_router("missing").await.expect("fetch").is_none());
    }
}
