//! Live check of one statement via `EXPLAIN (ANALYZE, FORMAT JSON)`.
//!
//! Connects using standard environment variables:
//! - PGHOST (default: localhost)
//! - PGPORT (default: 5432)
//! - PGUSER (default: $USER)
//! - PGPASSWORD (default: empty)
//! - PGDATABASE (default: same as PGUSER)

use postgres::{Client, NoTls};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use badplan_core::hooks::HookChain;

use crate::RunError;
use crate::replay::{ExecutionRecord, execute};

#[derive(Debug, Deserialize)]
struct ExplainEntry {
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

#[derive(Debug, Deserialize)]
struct PlanNode {
    #[serde(rename = "Node Type", default)]
    node_type: String,
    #[serde(rename = "Plan Rows")]
    plan_rows: f64,
    #[serde(rename = "Actual Rows")]
    actual_rows: Option<f64>,
    #[serde(rename = "Actual Loops")]
    actual_loops: Option<f64>,
}

/// Builds a libpq-style connection string from the environment.
fn connection_string_from_env() -> Result<String, RunError> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .map_err(|_| RunError::Postgres("PGUSER or USER not set".to_string()))?;

    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let password = std::env::var("PGPASSWORD").unwrap_or_default();
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

    Ok(if password.is_empty() {
        format!("host={} port={} user={} dbname={}", host, port, user, database)
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    })
}

fn format_postgres_error(e: &postgres::Error) -> String {
    match e.as_db_error() {
        Some(db_error) => format!("{}: {}", db_error.severity(), db_error.message()),
        None => e.to_string(),
    }
}

/// Extracts the top-level node counters from EXPLAIN JSON output.
fn parse_explain(sql: &str, output: Value) -> Result<ExecutionRecord, RunError> {
    let entries: Vec<ExplainEntry> =
        serde_json::from_value(output).map_err(|e| RunError::Explain(e.to_string()))?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| RunError::Explain("empty plan list".to_string()))?;
    let plan = entry.plan;

    let (Some(actual_rows), Some(loops)) = (plan.actual_rows, plan.actual_loops) else {
        return Err(RunError::Explain(
            "no actual row counts (statement was not analyzed)".to_string(),
        ));
    };
    debug!(
        node = %plan.node_type,
        plan_rows = plan.plan_rows,
        actual_rows,
        loops,
        "top plan node"
    );

    Ok(ExecutionRecord {
        query: sql.to_string(),
        plan_rows: plan.plan_rows,
        actual_rows,
        loops,
    })
}

/// Analyzes `sql` on the server and judges its top plan node.
pub fn run(chain: &HookChain, sql: &str, backend_id: u32) -> Result<(), RunError> {
    let conn = connection_string_from_env()?;
    let mut client =
        Client::connect(&conn, NoTls).map_err(|e| RunError::Postgres(format_postgres_error(&e)))?;

    let statement = format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", sql.trim_end_matches(';'));
    let row = client
        .query_one(statement.as_str(), &[])
        .map_err(|e| RunError::Postgres(format_postgres_error(&e)))?;
    let output: Value = row
        .try_get(0)
        .map_err(|e| RunError::Postgres(format_postgres_error(&e)))?;

    let record = parse_explain(sql, output)?;
    info!(
        plan_rows = record.plan_rows,
        actual_rows = record.actual_rows,
        loops = record.loops,
        "statement analyzed"
    );
    execute(chain, &record, backend_id);
    Ok(())
}
