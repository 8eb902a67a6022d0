//! LLM usage ledger and cost aggregates.

use crate::error::Result;
use crate::store::Store;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

/// Aggregated usage over one time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageBucket {
    pub requests: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
}

/// Usage aggregates served by `GET /usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub today: UsageBucket,
    pub this_week: UsageBucket,
    pub this_month: UsageBucket,
    pub total: UsageBucket,
}

impl Store {
    /// Record one LLM call. Callers are role names ("router", "planner",
    /// "worker") so aggregates can be split later if needed.
    pub async fn record_usage(
        &self,
        caller: &str,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO llm_usage (caller, model, prompt_tokens, completion_tokens, cost) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(caller)
        .bind(model)
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(cost)
        .execute(self.pool())
        .await
        .context("failed to record LLM usage")?;

        Ok(())
    }

    pub async fn usage_summary(&self) -> Result<UsageSummary> {
        Ok(UsageSummary {
            today: self.usage_bucket("created_at >= date('now')").await?,
            this_week: self
                .usage_bucket("created_at >= date('now', 'weekday 0', '-6 days')")
                .await?,
            this_month: self
                .usage_bucket("created_at >= date('now', 'start of month')")
                .await?,
            total: self.usage_bucket("1 = 1").await?,
        })
    }

    async fn usage_bucket(&self, condition: &str) -> Result<UsageBucket> {
        let query = format!(
            "SELECT COUNT(*) AS requests, COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
             COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
             COALESCE(SUM(cost), 0) AS cost FROM llm_usage WHERE {condition}"
        );

        let row = sqlx::query(&query)
            .fetch_one(self.pool())
            .await
            .context("failed to aggregate LLM usage")?;

        Ok(UsageBucket {
            requests: row.try_get("requests").unwrap_or(0),
            prompt_tokens: row.try_get("prompt_tokens").unwrap_or(0),
            completion_tokens: row.try_get("completion_tokens").unwrap_or(0),
            cost: row.try_get("cost").unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn usage_accumulates_into_every_bucket() {
        let store = Store::connect_in_memory().await.expect("store");

        store
            .record_usage("router", "gpt-4.1-nano", 120, 40, 0.0003)
            .await
            .expect("record");
        store
            .record_usage("worker", "claude-sonnet-4", 2000, 500, 0.012)
            .await
            .expect("record");

        let summary = store.usage_summary().await.expect("summary");
        assert_eq!(summary.total.requests, 2);
        assert_eq!(summary.total.prompt_tokens, 2120);
        assert_eq!(summary.today.requests, 2);
        assert!(summary.total.cost > 0.012);
    }
}
