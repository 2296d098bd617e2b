//! Executor hook chain.
//!
//! Hooks wrap the executor's start and end steps. Each hook receives a
//! [`Next`] continuation pointing at the hook installed before it, or at the
//! terminal [`Executor`] when it is the oldest one. The most recently
//! installed hook runs first.
//!
//! ```text
//!   run_start ──► hook C ──► hook B ──► hook A ──► StandardExecutor
//!                (newest)               (oldest)     (terminal)
//! ```
//!
//! Installation and removal are stack-like: only the topmost hook can be
//! removed, which restores exactly the chain that existed before it was
//! installed.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ChainError;
use crate::query::{ExecFlags, Executor, QueryDesc, StandardExecutor};

/// Interceptor around the executor's start and end steps.
///
/// Implementations must hand control to `next` exactly once per call; the
/// default methods do nothing but that.
pub trait ExecutorHook: Send + Sync {
    fn name(&self) -> &str;

    fn executor_start(&self, query: &mut QueryDesc, eflags: ExecFlags, next: Next<'_>) {
        next.executor_start(query, eflags);
    }

    fn executor_end(&self, query: &mut QueryDesc, next: Next<'_>) {
        next.executor_end(query);
    }
}

/// Continuation into the rest of the chain.
pub struct Next<'a> {
    below: &'a [Entry],
    terminal: &'a dyn Executor,
}

impl<'a> Next<'a> {
    fn split(self) -> Option<(&'a Entry, Next<'a>)> {
        let (entry, rest) = self.below.split_last()?;
        Some((
            entry,
            Next {
                below: rest,
                terminal: self.terminal,
            },
        ))
    }

    pub fn executor_start(self, query: &mut QueryDesc, eflags: ExecFlags) {
        let terminal = self.terminal;
        match self.split() {
            Some((entry, next)) => entry.hook.executor_start(query, eflags, next),
            None => terminal.executor_start(query, eflags),
        }
    }

    pub fn executor_end(self, query: &mut QueryDesc) {
        let terminal = self.terminal;
        match self.split() {
            Some((entry, next)) => entry.hook.executor_end(query, next),
            None => terminal.executor_end(query),
        }
    }
}

/// Handle identifying an installed hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    id: HookId,
    hook: Arc<dyn ExecutorHook>,
}

/// Ordered stack of executor hooks over a terminal executor.
pub struct HookChain {
    /// Oldest first.
    entries: Vec<Entry>,
    terminal: Arc<dyn Executor>,
    next_id: u64,
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HookChain {
    /// Chain over the [`StandardExecutor`].
    pub fn new() -> Self {
        Self::with_executor(Arc::new(StandardExecutor))
    }

    pub fn with_executor(terminal: Arc<dyn Executor>) -> Self {
        Self {
            entries: Vec::new(),
            terminal,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hook names, in execution order (newest first).
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().rev().map(|e| e.hook.name()).collect()
    }

    /// Puts `hook` on top of the chain.
    pub fn install(&mut self, hook: Arc<dyn ExecutorHook>) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        debug!(hook = hook.name(), %id, depth = self.entries.len(), "executor hook installed");
        self.entries.push(Entry { id, hook });
        id
    }

    /// Removes the topmost hook, which must be `id`.
    pub fn uninstall(&mut self, id: HookId) -> Result<Arc<dyn ExecutorHook>, ChainError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(ChainError::UnknownHook(id.0))?;
        let above = self.entries.len() - pos - 1;
        if above > 0 {
            return Err(ChainError::NotTopmost { id: id.0, above });
        }
        let entry = self.entries.remove(pos);
        debug!(hook = entry.hook.name(), %id, "executor hook removed");
        Ok(entry.hook)
    }

    pub fn run_start(&self, query: &mut QueryDesc, eflags: ExecFlags) {
        self.top().executor_start(query, eflags);
    }

    pub fn run_end(&self, query: &mut QueryDesc) {
        self.top().executor_end(query);
    }

    fn top(&self) -> Next<'_> {
        Next {
            below: &self.entries,
            terminal: self.terminal.as_ref(),
        }
    }
}
