//! Delivery of flagged verdicts.
//!
//! Without a dump directory every flagged query is logged inline, query text
//! included. With a directory configured the query text is written to its own
//! file instead, at most once per `min_dump_interval_ms`; verdicts inside the
//! cooldown window are dropped.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::module::MODULE_NAME;
use crate::query::QueryDesc;
use crate::settings::Settings;
use crate::verdict::Verdict;

/// `last_dump_ms` value before the first dump.
const NEVER: u64 = u64::MAX;

/// What happened to a delivered verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Logged inline.
    Logged,
    /// Query text written to this file.
    Dumped(PathBuf),
    /// Dropped: inside the dump cooldown window.
    Throttled,
    /// Dump write failed; the error was logged.
    Failed,
}

/// Shared by every worker; holds the dump rate-limit state.
pub struct VerdictSink {
    clock: Arc<dyn MonotonicClock>,
    last_dump_ms: AtomicU64,
}

impl VerdictSink {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            clock,
            last_dump_ms: AtomicU64::new(NEVER),
        }
    }

    /// Time of the last successful dump, if any.
    pub fn last_dump_ms(&self) -> Option<u64> {
        match self.last_dump_ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Some(ms),
        }
    }

    pub fn deliver(&self, verdict: &Verdict, query: &QueryDesc, settings: &Settings) -> SinkOutcome {
        match settings.log_directory.as_deref() {
            None => {
                log_inline(verdict, query, settings);
                SinkOutcome::Logged
            }
            Some(dir) => self.dump(dir, settings.min_dump_interval_ms, verdict, query),
        }
    }

    fn dump(&self, dir: &Path, interval_ms: u32, verdict: &Verdict, query: &QueryDesc) -> SinkOutcome {
        let now = self.clock.now_ms();
        // Concurrent workers may both pass this check; their file names differ
        // by backend id, so the worst case is one extra file.
        let last = self.last_dump_ms.load(Ordering::Relaxed);
        if last != NEVER && now.saturating_sub(last) <= u64::from(interval_ms) {
            debug!(
                backend = query.backend_id,
                since_last_ms = now.saturating_sub(last),
                interval_ms,
                "pg_badplan: dump skipped, inside min_dump_interval_ms"
            );
            return SinkOutcome::Throttled;
        }

        let path = dump_path(dir, query.backend_id, now);
        match write_new_file(&path, &query.source_text) {
            Ok(()) => {
                self.last_dump_ms.store(now, Ordering::Relaxed);
                info!(
                    estimated = verdict.estimated,
                    actual = verdict.actual,
                    ratio = %format_ratio(verdict.ratio),
                    path = %path.display(),
                    "pg_badplan: bad plan query dumped"
                );
                SinkOutcome::Dumped(path)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "pg_badplan: could not write query dump"
                );
                SinkOutcome::Failed
            }
        }
    }
}

fn log_inline(verdict: &Verdict, query: &QueryDesc, settings: &Settings) {
    info!(
        backend = query.backend_id,
        query = %query.source_text,
        "pg_badplan: expected={:.0} actual={:.0} ratio={} ({:.3})",
        verdict.estimated,
        verdict.actual,
        format_ratio(verdict.ratio),
        settings.bounds.ratio
    );
}

fn format_ratio(ratio: Option<f64>) -> String {
    match ratio {
        Some(r) => format!("{r:.3}"),
        None => "undefined (zero estimate)".to_string(),
    }
}

/// `<dir>/pg_badplan-<backend>-<monotonic ms>.sql`
pub fn dump_path(dir: &Path, backend_id: u32, now_ms: u64) -> PathBuf {
    dir.join(format!("{MODULE_NAME}-{backend_id}-{now_ms}.sql"))
}

fn write_new_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratio::RatioBounds;
    use std::fmt;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer};
    use tracing_subscriber::prelude::*;

    #[derive(Clone, Default)]
    struct Captured {
        messages: Arc<Mutex<Vec<String>>>,
        numbers: Arc<Mutex<Vec<(String, f64)>>>,
    }

    #[derive(Default)]
    struct EventVisitor {
        message: String,
        numbers: Vec<(String, f64)>,
    }

    impl Visit for EventVisitor {
        fn record_f64(&mut self, field: &Field, value: f64) {
            self.numbers.push((field.name().to_string(), value));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Captured {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = EventVisitor::default();
            event.record(&mut visitor);
            self.messages.lock().unwrap().push(visitor.message);
            self.numbers.lock().unwrap().extend(visitor.numbers);
        }
    }

    fn flagged_verdict() -> Verdict {
        Verdict {
            estimated: 10_000.0,
            actual: 500.0,
            ratio: Some(0.05),
            flagged: true,
        }
    }

    fn dump_settings(dir: &Path, interval_ms: u32) -> Settings {
        Settings {
            log_directory: Some(dir.to_path_buf()),
            min_dump_interval_ms: interval_ms,
            ..Settings::default()
        }
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_inline_logs_every_verdict() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let sink = VerdictSink::new(Arc::new(ManualClock::new(0)));
        let settings = Settings::default();
        let query = QueryDesc::new("select * from big", 10_000.0).with_backend_id(7);

        let outcomes: Vec<_> = tracing::subscriber::with_default(subscriber, || {
            (0..3)
                .map(|_| sink.deliver(&flagged_verdict(), &query, &settings))
                .collect()
        });

        assert!(outcomes.iter().all(|o| *o == SinkOutcome::Logged));
        let messages = captured.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            "pg_badplan: expected=10000 actual=500 ratio=0.050 (0.200)"
        );
        assert_eq!(sink.last_dump_ms(), None);
    }

    #[test]
    fn test_inline_zero_estimate_ratio_text() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let sink = VerdictSink::new(Arc::new(ManualClock::new(0)));
        let verdict = Verdict {
            estimated: 0.0,
            actual: 5_000.0,
            ratio: None,
            flagged: true,
        };
        tracing::subscriber::with_default(subscriber, || {
            sink.deliver(&verdict, &QueryDesc::new("q", 0.0), &Settings::default());
        });
        let messages = captured.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("ratio=undefined"));
    }

    #[test]
    fn test_dump_writes_query_text() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(5_000));
        let sink = VerdictSink::new(clock);
        let query = QueryDesc::new("select * from orders where id > 10", 10_000.0)
            .with_backend_id(4242);

        let outcome = sink.deliver(&flagged_verdict(), &query, &dump_settings(dir.path(), 1000));

        let expected_path = dir.path().join("pg_badplan-4242-5000.sql");
        assert_eq!(outcome, SinkOutcome::Dumped(expected_path.clone()));
        assert_eq!(
            std::fs::read_to_string(&expected_path).unwrap(),
            "select * from orders where id > 10"
        );
        assert_eq!(sink.last_dump_ms(), Some(5_000));
    }

    #[test]
    fn test_dump_logs_counts_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let sink = VerdictSink::new(Arc::new(ManualClock::new(42)));
        let query = QueryDesc::new("select * from orders", 10_000.0).with_backend_id(3);

        let outcome = tracing::subscriber::with_default(subscriber, || {
            sink.deliver(&flagged_verdict(), &query, &dump_settings(dir.path(), 0))
        });

        assert!(matches!(outcome, SinkOutcome::Dumped(_)));
        let messages = captured.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), ["pg_badplan: bad plan query dumped"]);
        let numbers = captured.numbers.lock().unwrap();
        assert!(numbers.contains(&("estimated".to_string(), 10_000.0)));
        assert!(numbers.contains(&("actual".to_string(), 500.0)));
    }

    #[test]
    fn test_dump_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let sink = VerdictSink::new(Arc::clone(&clock) as Arc<dyn MonotonicClock>);
        let settings = dump_settings(dir.path(), 1_000);
        let query = QueryDesc::new("select 1", 10_000.0).with_backend_id(1);

        assert!(matches!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Dumped(_)
        ));

        clock.advance(500);
        assert_eq!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Throttled
        );

        // Exactly the interval is still inside the window.
        clock.set(11_000);
        assert_eq!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Throttled
        );
        assert_eq!(files_in(dir.path()), 1);

        clock.set(11_001);
        assert!(matches!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Dumped(_)
        ));
        clock.advance(1_001);
        assert!(matches!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Dumped(_)
        ));
        assert_eq!(files_in(dir.path()), 3);
    }

    #[test]
    fn test_dump_failure_is_absorbed_and_does_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("removed");
        std::fs::create_dir(&gone).unwrap();
        let settings = dump_settings(&gone, 0);
        std::fs::remove_dir(&gone).unwrap();

        let clock = Arc::new(ManualClock::new(100));
        let sink = VerdictSink::new(Arc::clone(&clock) as Arc<dyn MonotonicClock>);
        let query = QueryDesc::new("select 1", 10_000.0);

        assert_eq!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Failed
        );
        assert_eq!(sink.last_dump_ms(), None);

        // Directory comes back: the next verdict is not throttled.
        std::fs::create_dir(&gone).unwrap();
        clock.advance(1);
        assert!(matches!(
            sink.deliver(&flagged_verdict(), &query, &settings),
            SinkOutcome::Dumped(_)
        ));
    }

    #[test]
    fn test_concurrent_backends_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(VerdictSink::new(Arc::new(ManualClock::new(1_000))));
        let settings = Arc::new(dump_settings(dir.path(), 0));

        let handles: Vec<_> = (1..=8u32)
            .map(|backend| {
                let sink = Arc::clone(&sink);
                let settings = Arc::clone(&settings);
                std::thread::spawn(move || {
                    let query = QueryDesc::new(format!("select {backend}"), 10_000.0)
                        .with_backend_id(backend);
                    sink.deliver(&flagged_verdict(), &query, &settings)
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let dumped = outcomes
            .iter()
            .filter(|o| matches!(o, SinkOutcome::Dumped(_)))
            .count();
        assert!(dumped >= 1);
        assert!(!outcomes.contains(&SinkOutcome::Failed));
        assert_eq!(files_in(dir.path()), dumped);
    }

    #[test]
    fn test_dump_path_format() {
        assert_eq!(
            dump_path(Path::new("/var/log/pg"), 123, 456_789),
            PathBuf::from("/var/log/pg/pg_badplan-123-456789.sql")
        );
    }

    #[test]
    fn test_ratio_bounds_in_message_follow_settings() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        let sink = VerdictSink::new(Arc::new(ManualClock::new(0)));
        let settings = Settings {
            bounds: RatioBounds::new(0.5),
            ..Settings::default()
        };
        tracing::subscriber::with_default(subscriber, || {
            sink.deliver(&flagged_verdict(), &QueryDesc::new("q", 1.0), &settings);
        });
        assert!(captured.messages.lock().unwrap()[0].ends_with("(0.500)"));
    }
}
