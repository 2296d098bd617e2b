//! The pg_badplan executor hook and its install/uninstall lifecycle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ChainError, InitError};
use crate::hooks::{ExecutorHook, HookChain, HookId, Next};
use crate::query::{ExecFlags, InstrumentOptions, QueryDesc};
use crate::settings::SettingsStore;
use crate::sink::{SinkOutcome, VerdictSink};
use crate::verdict::{self, Verdict};

/// Module name, used as the parameter prefix and in dump file names.
pub const MODULE_NAME: &str = "pg_badplan";

/// When the host is loading the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadPhase {
    /// Server startup, before any query is processed.
    SharedPreload,
    /// Any later point (e.g. a session loading the library on demand).
    Runtime,
}

/// Executor hook comparing planner estimates with actual rows.
pub struct BadPlan {
    settings: Arc<SettingsStore>,
    sink: Arc<VerdictSink>,
}

impl BadPlan {
    pub fn new(settings: Arc<SettingsStore>, sink: Arc<VerdictSink>) -> Self {
        Self { settings, sink }
    }

    /// Closes the running loop, judges the query and delivers flagged verdicts.
    ///
    /// Returns `None` when the query has nothing to judge.
    fn inspect(&self, query: &mut QueryDesc) -> Option<(Verdict, Option<SinkOutcome>)> {
        let settings = self.settings.snapshot();
        if !settings.enabled {
            return None;
        }
        let plan_rows = query.planned_stmt.as_ref()?.plan_rows;
        let instr = query.instrumentation_mut()?;
        instr.end_loop();

        let verdict = verdict::evaluate_instrumentation(
            plan_rows,
            instr,
            &settings.bounds,
            settings.min_row_threshold,
        )?;
        if !verdict.flagged {
            return Some((verdict, None));
        }
        let outcome = self.sink.deliver(&verdict, query, &settings);
        Some((verdict, Some(outcome)))
    }
}

impl ExecutorHook for BadPlan {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn executor_start(&self, query: &mut QueryDesc, eflags: ExecFlags, next: Next<'_>) {
        // Actual row counts are only tracked when instrumentation is requested.
        if self.settings.snapshot().enabled {
            query.instrument_options |= InstrumentOptions::ROWS;
        }
        next.executor_start(query, eflags);
    }

    fn executor_end(&self, query: &mut QueryDesc, next: Next<'_>) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.inspect(query))) {
            Ok(Some((verdict, outcome))) => {
                debug!(
                    backend = query.backend_id,
                    flagged = verdict.flagged,
                    outcome = ?outcome,
                    "pg_badplan: query judged"
                );
            }
            Ok(None) => {}
            Err(_) => {
                warn!(
                    backend = query.backend_id,
                    "pg_badplan: internal error while judging query, skipped"
                );
            }
        }
        next.executor_end(query);
    }
}

/// Handle to an installed module.
#[derive(Debug)]
pub struct Installed {
    id: HookId,
}

impl Installed {
    /// Removes the module's hook, restoring the chain present before install.
    pub fn uninstall(self, chain: &mut HookChain) -> Result<(), ChainError> {
        chain.uninstall(self.id).map(drop)
    }
}

/// Installs the module on top of `chain`.
///
/// Only allowed while the server is starting up; otherwise the chain is left
/// untouched.
pub fn install(
    chain: &mut HookChain,
    phase: LoadPhase,
    settings: Arc<SettingsStore>,
    sink: Arc<VerdictSink>,
) -> Result<Installed, InitError> {
    if phase != LoadPhase::SharedPreload {
        return Err(InitError::NotPreloaded);
    }
    let id = chain.install(Arc::new(BadPlan::new(settings, sink)));
    Ok(Installed { id })
}
