//! badplan-core — detects queries whose planner row estimate was badly off.
//!
//! Provides:
//! - `settings` — runtime parameters (`pg_badplan.*`) with validation
//! - `ratio` — under/over bounds derived from the configured ratio
//! - `query` — host query record, instrumentation counters, default executor
//! - `hooks` — executor hook chain with LIFO install/uninstall
//! - `verdict` — estimated vs. actual rows test
//! - `sink` — inline logging or rate-limited dumps of flagged queries
//! - `clock` — monotonic clock abstraction (real and manual)
//! - `module` — the pg_badplan hook and its load-time installation
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use badplan_core::clock::SystemClock;
//! use badplan_core::hooks::HookChain;
//! use badplan_core::module::{self, LoadPhase};
//! use badplan_core::query::{ExecFlags, QueryDesc};
//! use badplan_core::settings::SettingsStore;
//! use badplan_core::sink::VerdictSink;
//!
//! let mut chain = HookChain::new();
//! let settings = Arc::new(SettingsStore::new());
//! let sink = Arc::new(VerdictSink::new(Arc::new(SystemClock::new())));
//! module::install(&mut chain, LoadPhase::SharedPreload, settings, sink).unwrap();
//!
//! let mut query = QueryDesc::new("select * from orders", 10_000.0);
//! chain.run_start(&mut query, ExecFlags::NONE);
//! query.run_loop(500.0);
//! chain.run_end(&mut query); // logs: pg_badplan: expected=10000 actual=500 ...
//! ```

pub mod clock;
pub mod error;
pub mod hooks;
pub mod module;
pub mod query;
pub mod ratio;
pub mod settings;
pub mod sink;
pub mod verdict;

pub use error::{ChainError, ConfigError, InitError};
pub use module::{BadPlan, Installed, LoadPhase, MODULE_NAME, install};
pub use settings::{Settings, SettingsStore};
pub use verdict::Verdict;
