//! Per-planner SQL engine: CSV ingestion, identifier sanitisation, and
//! markdown rendering of query results.
//!
//! Each planner that receives data files gets one SQLite database file
//! (`<planner>/database.db`) created during initial planning. SQL workers
//! open it read-only; the serial planner chain guarantees a single writer.

use crate::error::Result;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column as _, Row as _, SqlitePool, TypeInfo as _};
use std::path::Path;

/// How many preview rows TableMeta captures.
const PREVIEW_ROWS: usize = 10;

/// One column of a loaded table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

/// Structural summary of a loaded tabular source, attached to planners
/// and copied into workers so SQL tasks can be generated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub row_count: i64,
    /// First rows rendered as a markdown table.
    pub preview_markdown: String,
}

/// Open (creating if needed) a planner database file.
pub async fn open_planner_db(path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .with_context(|| format!("failed to open planner database at {}", path.display()))?;
    Ok(pool)
}

/// Open a planner database read-only, for SQL workers.
pub async fn open_planner_db_readonly(path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite://{}?mode=ro", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .with_context(|| format!("failed to open planner database at {}", path.display()))?;
    Ok(pool)
}

/// Clean an input string into a valid SQL table name.
///
/// Non-alphanumerics become spaces, runs collapse to single underscores,
/// a non-alphabetic leading character gets a `table_` prefix, and the
/// result is verified with a probe DDL; names the engine still rejects
/// (reserved words) fall back to `table_<cleaned>`.
pub async fn clean_table_name(pool: &SqlitePool, input: &str) -> String {
    let cleaned = sanitize_identifier(input);
    let cleaned = if cleaned.is_empty() {
        "table".to_string()
    } else if !cleaned.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        format!("table_{cleaned}")
    } else {
        cleaned
    };

    let probe = format!("CREATE TEMP VIEW {cleaned} AS SELECT 1");
    match sqlx::query(&probe).execute(pool).await {
        Ok(_) => {
            let drop = format!("DROP VIEW IF EXISTS {cleaned}");
            let _ = sqlx::query(&drop).execute(pool).await;
            cleaned
        }
        Err(_) => format!("table_{cleaned}"),
    }
}

/// Clean an input string into a valid SQL column name. Collisions with
/// prior columns in the same table get a zero-padded index suffix.
pub fn clean_column_name(input: &str, index: usize, prior: &[String]) -> String {
    let cleaned = sanitize_identifier(input);
    let cleaned = if cleaned.is_empty() {
        format!("column_{index:02}")
    } else if !cleaned.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        format!("column_{cleaned}")
    } else {
        cleaned
    };

    if prior.iter().any(|name| name == &cleaned) {
        format!("{cleaned}_{index:02}")
    } else {
        cleaned
    }
}

fn sanitize_identifier(input: &str) -> String {
    let spaced: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    spaced.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Load a CSV file into a table and return its metadata.
///
/// All columns are created as TEXT; the generated SQL casts where it
/// needs numerics, which keeps ingestion tolerant of ragged input.
pub async fn ingest_csv(pool: &SqlitePool, filepath: &Path, table_name: &str) -> Result<TableMeta> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(filepath)
        .with_context(|| format!("failed to open CSV {}", filepath.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read CSV headers from {}", filepath.display()))?
        .clone();

    let mut columns: Vec<String> = Vec::with_capacity(headers.len());
    for (index, header) in headers.iter().enumerate() {
        let name = clean_column_name(header, index, &columns);
        columns.push(name);
    }
    if columns.is_empty() {
        return Err(anyhow::anyhow!("CSV {} has no columns", filepath.display()).into());
    }

    let column_ddl = columns
        .iter()
        .map(|name| format!("{name} TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    sqlx::query(&format!("DROP TABLE IF EXISTS {table_name}"))
        .execute(pool)
        .await
        .with_context(|| format!("failed to drop existing table {table_name}"))?;
    sqlx::query(&format!("CREATE TABLE {table_name} ({column_ddl})"))
        .execute(pool)
        .await
        .with_context(|| format!("failed to create table {table_name}"))?;

    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!(
        "INSERT INTO {table_name} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );

    let mut tx = pool
        .begin()
        .await
        .context("failed to open CSV ingest transaction")?;
    for record in reader.records() {
        let record =
            record.with_context(|| format!("failed to read CSV row from {}", filepath.display()))?;
        let mut query = sqlx::query(&insert);
        for index in 0..columns.len() {
            query = query.bind(record.get(index).unwrap_or("").to_string());
        }
        query
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert CSV row into {table_name}"))?;
    }
    tx.commit()
        .await
        .context("failed to commit CSV ingest transaction")?;

    table_metadata(pool, table_name, &columns).await
}

async fn table_metadata(
    pool: &SqlitePool,
    table_name: &str,
    columns: &[String],
) -> Result<TableMeta> {
    let row_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table_name}"))
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count rows in {table_name}"))?;

    let preview_markdown = query_to_markdown(
        pool,
        &format!("SELECT * FROM {table_name} LIMIT {PREVIEW_ROWS}"),
    )
    .await?;

    Ok(TableMeta {
        name: table_name.to_string(),
        columns: columns
            .iter()
            .map(|name| ColumnMeta {
                name: name.clone(),
                data_type: "TEXT".to_string(),
            })
            .collect(),
        row_count,
        preview_markdown,
    })
}

/// Execute a query and render its result set as a markdown table.
pub async fn query_to_markdown(pool: &SqlitePool, sql: &str) -> Result<String> {
    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("query failed: {sql}"))?;

    let Some(first) = rows.first() else {
        return Ok("(no rows)".to_string());
    };

    let headers: Vec<String> = first
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();

    let mut body: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(headers.len());
        for (index, column) in row.columns().iter().enumerate() {
            cells.push(cell_to_string(row, index, column.type_info().name()));
        }
        body.push(cells);
    }

    Ok(render_markdown_table(&headers, &body))
}

fn cell_to_string(row: &sqlx::sqlite::SqliteRow, index: usize, type_name: &str) -> String {
    match type_name {
        "INTEGER" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(|v| v.to_string()),
        "REAL" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(|v| v.to_string()),
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(|v| v.to_string()),
        _ => row.try_get::<Option<String>, _>(index).ok().flatten(),
    }
    .unwrap_or_else(|| "NULL".to_string())
}

/// Render rows as a GitHub-flavoured markdown table.
pub fn render_markdown_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", headers.join(" | ")));
    lines.push(format!(
        "| {} |",
        headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in rows {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect")
    }

    fn write_csv(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create csv");
        file.write_all(content.as_bytes()).expect("write csv");
        path
    }

    #[tokio::test]
    async fn empty_table_name_falls_back() {
        let pool = memory_pool().await;
        assert_eq!(clean_table_name(&pool, "").await, "table");
        assert_eq!(clean_table_name(&pool, "!!!").await, "table");
    }

    #[tokio::test]
    async fn table_names_are_sanitised_and_prefixed() {
        let pool = memory_pool().await;
        assert_eq!(clean_table_name(&pool, "sales data (2024)").await, "sales_data_2024");
        assert_eq!(clean_table_name(&pool, "2024 sales").await, "table_2024_sales");
        // Reserved word fails the probe and falls back.
        assert_eq!(clean_table_name(&pool, "order").await, "table_order");
    }

    #[test]
    fn column_collisions_get_zero_padded_suffix() {
        let prior = vec!["region".to_string()];
        assert_eq!(clean_column_name("region", 1, &prior), "region_01");
        assert_eq!(clean_column_name("Revenue ($)", 2, &prior), "Revenue");
        assert_eq!(clean_column_name("", 3, &prior), "column_03");
    }

    #[tokio::test]
    async fn csv_ingest_builds_table_and_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = write_csv(
            dir.path(),
            "sales.csv",
            "region,revenue\nnorth,1200\nsouth,3010\n",
        );

        let db_path = dir.path().join("database.db");
        let pool = open_planner_db(&db_path).await.expect("open");
        let table_name = clean_table_name(&pool, "sales").await;
        let meta = ingest_csv(&pool, &csv_path, &table_name).await.expect("ingest");

        assert_eq!(meta.name, "sales");
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.columns.len(), 2);
        assert!(meta.preview_markdown.contains("| region | revenue |"));
        assert!(meta.preview_markdown.contains("| south | 3010 |"));

        let total: f64 =
            sqlx::query_scalar("SELECT SUM(CAST(revenue AS REAL)) FROM sales")
                .fetch_one(&pool)
                .await
                .expect("sum");
        assert_eq!(total, 4210.0);
    }

    #[tokio::test]
    async fn query_markdown_handles_aggregates_and_empty_sets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = write_csv(dir.path(), "sales.csv", "region,revenue\nnorth,1\n");

        let pool = open_planner_db(&dir.path().join("database.db")).await.expect("open");
        ingest_csv(&pool, &csv_path, "sales").await.expect("ingest");

        let markdown = query_to_markdown(&pool, "SELECT COUNT(*) AS n FROM sales")
            .await
            .expect("query");
        assert!(markdown.contains("| n |"));
        assert!(markdown.contains("| 1 |"));

        let empty = query_to_markdown(&pool, "SELECT * FROM sales WHERE region = 'west'")
            .await
            .expect("query");
        assert_eq!(empty, "(no rows)");

        assert!(query_to_markdown(&pool, "SELECT * FROM missing_table").await.is_err());
    }
}
