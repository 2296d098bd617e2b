//! Host-side query execution record and the default executor behaviour.
//!
//! This is the minimal model of what the database engine hands to executor
//! hooks: the query text, the top-level plan estimate, and the runtime
//! instrumentation attached to the top plan node once execution starts.

use std::ops::{BitOr, BitOrAssign};

/// Instrumentation requested for a query (bit set).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InstrumentOptions(u32);

impl InstrumentOptions {
    pub const NONE: Self = Self(0);
    pub const TIMER: Self = Self(1 << 0);
    pub const BUFFERS: Self = Self(1 << 1);
    pub const ROWS: Self = Self(1 << 2);
    pub const WAL: Self = Self(1 << 3);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InstrumentOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InstrumentOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Executor start flags passed through the hook chain untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExecFlags(u32);

impl ExecFlags {
    pub const NONE: Self = Self(0);
    /// Plan only (EXPLAIN without ANALYZE); the query never runs and no
    /// counters are allocated.
    pub const EXPLAIN_ONLY: Self = Self(1 << 0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Per-node runtime counters.
///
/// Tuples produced during the current loop accumulate in `tuple_count`
/// and move to `ntuples` when the loop ends.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Instrumentation {
    pub options: InstrumentOptions,
    running: bool,
    tuple_count: f64,
    /// Tuples produced over all finished loops.
    pub ntuples: f64,
    /// Number of finished loops.
    pub nloops: f64,
}

impl Instrumentation {
    pub fn new(options: InstrumentOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Counters of an already finished execution, as reported by EXPLAIN ANALYZE.
    pub fn finished(options: InstrumentOptions, ntuples: f64, nloops: f64) -> Self {
        Self {
            options,
            running: false,
            tuple_count: 0.0,
            ntuples,
            nloops,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start_node(&mut self) {
        self.running = true;
    }

    pub fn stop_node(&mut self, tuples: f64) {
        self.tuple_count += tuples;
    }

    /// Closes the current loop. No-op when no loop is running.
    pub fn end_loop(&mut self) {
        if !self.running {
            return;
        }
        self.ntuples += self.tuple_count;
        self.nloops += 1.0;
        self.tuple_count = 0.0;
        self.running = false;
    }
}

/// Planner output for the top-level plan node.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedStmt {
    /// Estimated rows emitted per loop.
    pub plan_rows: f64,
}

/// Executor state of the top-level plan node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanState {
    pub instrument: Option<Instrumentation>,
}

/// One query as seen by executor hooks.
#[derive(Clone, Debug)]
pub struct QueryDesc {
    pub source_text: String,
    /// Identity of the worker running the query.
    pub backend_id: u32,
    pub instrument_options: InstrumentOptions,
    pub planned_stmt: Option<PlannedStmt>,
    pub plan_state: Option<PlanState>,
}

impl QueryDesc {
    pub fn new(source_text: impl Into<String>, plan_rows: f64) -> Self {
        Self {
            source_text: source_text.into(),
            backend_id: std::process::id(),
            instrument_options: InstrumentOptions::NONE,
            planned_stmt: Some(PlannedStmt { plan_rows }),
            plan_state: None,
        }
    }

    pub fn with_backend_id(mut self, backend_id: u32) -> Self {
        self.backend_id = backend_id;
        self
    }

    pub fn instrumentation(&self) -> Option<&Instrumentation> {
        self.plan_state.as_ref()?.instrument.as_ref()
    }

    pub fn instrumentation_mut(&mut self) -> Option<&mut Instrumentation> {
        self.plan_state.as_mut()?.instrument.as_mut()
    }

    /// Records one execution loop of the top node producing `tuples` rows.
    ///
    /// The previous loop is closed first; the latest one stays open until
    /// something calls [`Instrumentation::end_loop`]. Returns false when the
    /// query carries no instrumentation.
    pub fn run_loop(&mut self, tuples: f64) -> bool {
        let Some(instr) = self.instrumentation_mut() else {
            return false;
        };
        instr.end_loop();
        instr.start_node();
        instr.stop_node(tuples);
        true
    }
}

/// Terminal executor behaviour at the bottom of the hook chain.
pub trait Executor: Send + Sync {
    fn executor_start(&self, query: &mut QueryDesc, eflags: ExecFlags);
    fn executor_end(&self, query: &mut QueryDesc);
}

/// Default executor: allocates plan state on start, releases it on end.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardExecutor;

impl Executor for StandardExecutor {
    fn executor_start(&self, query: &mut QueryDesc, eflags: ExecFlags) {
        if query.planned_stmt.is_none() || query.plan_state.is_some() {
            return;
        }
        let options = query.instrument_options;
        let runs = !eflags.contains(ExecFlags::EXPLAIN_ONLY);
        let instrument = (runs && !options.is_empty()).then(|| Instrumentation::new(options));
        query.plan_state = Some(PlanState { instrument });
    }

    fn executor_end(&self, query: &mut QueryDesc) {
        query.plan_state = None;
    }
}
