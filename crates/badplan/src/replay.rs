//! JSON-lines replay of recorded query executions.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use badplan_core::hooks::HookChain;
use badplan_core::query::{ExecFlags, Instrumentation, QueryDesc};

use crate::RunError;

/// One finished execution of a query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionRecord {
    pub query: String,
    /// Planner estimate for the top-level node.
    pub plan_rows: f64,
    /// Rows per loop, as EXPLAIN ANALYZE reports them.
    pub actual_rows: f64,
    #[serde(default = "default_loops")]
    pub loops: f64,
}

fn default_loops() -> f64 {
    1.0
}

/// Runs one execution through the chain, as the server would.
pub fn execute(chain: &HookChain, record: &ExecutionRecord, backend_id: u32) -> QueryDesc {
    let mut query = QueryDesc::new(record.query.as_str(), record.plan_rows).with_backend_id(backend_id);
    chain.run_start(&mut query, ExecFlags::NONE);

    // Counters only exist when some hook asked for them.
    if let Some(instr) = query.instrumentation_mut() {
        *instr = Instrumentation::finished(
            instr.options,
            record.actual_rows * record.loops,
            record.loops,
        );
    }

    chain.run_end(&mut query);
    query
}

/// Replays every record of `path` ("-" for stdin). Malformed lines are skipped.
pub fn run(chain: &HookChain, path: &Path, backend_id: u32) -> Result<(), RunError> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };

    let (replayed, skipped) = replay_lines(chain, reader, backend_id)?;
    info!(replayed, skipped, "replay finished");
    Ok(())
}

fn replay_lines(
    chain: &HookChain,
    reader: impl BufRead,
    backend_id: u32,
) -> Result<(usize, usize), RunError> {
    let mut replayed = 0;
    let mut skipped = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExecutionRecord>(&line) {
            Ok(record) => {
                debug!(line = idx + 1, query = %record.query, "replaying execution");
                execute(chain, &record, backend_id);
                replayed += 1;
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping malformed record");
                skipped += 1;
            }
        }
    }
    Ok((replayed, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use badplan_core::clock::ManualClock;
    use badplan_core::module::{LoadPhase, install};
    use badplan_core::settings::SettingsStore;
    use badplan_core::sink::VerdictSink;
    use std::sync::Arc;

    fn dumping_chain(dir: &Path) -> HookChain {
        let mut chain = HookChain::new();
        let settings = Arc::new(SettingsStore::new());
        settings.set_log_directory(dir.to_str().unwrap()).unwrap();
        settings.set_min_dump_interval_ms(0).unwrap();
        let sink = Arc::new(VerdictSink::new(Arc::new(ManualClock::new(1))));
        install(&mut chain, LoadPhase::SharedPreload, settings, sink).unwrap();
        chain
    }

    #[test]
    fn test_record_defaults_to_one_loop() {
        let r: ExecutionRecord =
            serde_json::from_str(r#"{"query":"select 1","plan_rows":1,"actual_rows":1}"#).unwrap();
        assert_eq!(r.loops, 1.0);
    }

    #[test]
    fn test_execute_flags_and_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let chain = dumping_chain(dir.path());
        let record = ExecutionRecord {
            query: "select * from orders".into(),
            plan_rows: 10_000.0,
            actual_rows: 500.0,
            loops: 1.0,
        };

        let q = execute(&chain, &record, 9);
        assert!(q.plan_state.is_none());
        let dumped = dir.path().join("pg_badplan-9-1.sql");
        assert_eq!(std::fs::read_to_string(dumped).unwrap(), "select * from orders");
    }

    #[test]
    fn test_execute_without_hooks_is_plain() {
        let chain = HookChain::new();
        let record = ExecutionRecord {
            query: "select 1".into(),
            plan_rows: 1.0,
            actual_rows: 1.0,
            loops: 1.0,
        };
        let q = execute(&chain, &record, 1);
        assert!(q.instrument_options.is_empty());
    }

    #[test]
    fn test_replay_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let chain = dumping_chain(dir.path());
        let input = concat!(
            r#"{"query":"q1","plan_rows":10,"actual_rows":15}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"query":"q2","plan_rows":10000,"actual_rows":500,"loops":2}"#,
            "\n",
        );

        let (replayed, skipped) = replay_lines(&chain, input.as_bytes(), 3).unwrap();
        assert_eq!((replayed, skipped), (2, 1));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_run_missing_file() {
        let chain = HookChain::new();
        let err = run(&chain, Path::new("/nonexistent/records.jsonl"), 1).unwrap_err();
        assert!(matches!(err, RunError::Io(_)));
    }
}
