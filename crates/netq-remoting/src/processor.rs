//! Request processors and RPC hooks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::protocol::Command;
use crate::scheduler::{panic_message, ElasticScheduler};

/// Application logic serving one or more request codes.
///
/// Runs on a scheduler worker thread, never on an I/O thread. The returned
/// command is sent back as the response; it is discarded for one-way
/// requests. Returning `Ok(None)` for a two-way request sends nothing.
pub trait Processor: Send + Sync + 'static {
    /// Handles `request` received on `channel`.
    fn process(&self, channel: &Channel, request: Command) -> Result<Option<Command>>;
}

impl<F> Processor for F
where
    F: Fn(&Channel, Command) -> Result<Option<Command>> + Send + Sync + 'static,
{
    fn process(&self, channel: &Channel, request: Command) -> Result<Option<Command>> {
        self(channel, request)
    }
}

/// Observer invoked around request send and response receipt.
///
/// Hooks may tag request headers before a request leaves or is processed.
/// They see responses read-only. Failures are logged and do not affect the
/// call or sibling hooks.
pub trait RpcHook: Send + Sync + 'static {
    /// Called before a request is sent (client side) or processed (server side).
    fn before_request(&self, remote_addr: &str, request: &mut Command) -> Result<()>;

    /// Called once a response has been received (client side) or produced
    /// (server side).
    fn after_response(&self, remote_addr: &str, request: &Command, response: &Command) -> Result<()>;
}

/// A processor bound to the scheduler that runs it.
#[derive(Clone)]
pub struct ProcessorEntry {
    /// The processor.
    pub processor: Arc<dyn Processor>,
    /// Scheduler executing the processor.
    pub scheduler: Arc<ElasticScheduler>,
}

impl std::fmt::Debug for ProcessorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorEntry")
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}

/// Request code to processor mapping with an optional fallback entry.
#[derive(Default)]
pub struct ProcessorTable {
    entries: DashMap<i32, ProcessorEntry>,
    default: RwLock<Option<ProcessorEntry>>,
}

impl ProcessorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` for `code`, returning the entry it replaced.
    pub fn register(&self, code: i32, entry: ProcessorEntry) -> Option<ProcessorEntry> {
        self.entries.insert(code, entry)
    }

    /// Sets the entry serving unmapped codes.
    pub fn register_default(&self, entry: ProcessorEntry) {
        *self.default.write() = Some(entry);
    }

    /// Exact lookup, without the default fallback.
    pub fn get(&self, code: i32) -> Option<ProcessorEntry> {
        self.entries.get(&code).map(|e| e.value().clone())
    }

    /// Lookup falling back to the default entry.
    pub fn lookup(&self, code: i32) -> Option<ProcessorEntry> {
        self.get(code).or_else(|| self.default.read().clone())
    }

    /// Number of code-specific entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no code-specific entries are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered list of RPC hooks.
#[derive(Default)]
pub struct HookChain {
    hooks: RwLock<Vec<Arc<dyn RpcHook>>>,
}

impl HookChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook`; returns false if this instance is already registered.
    pub fn register(&self, hook: Arc<dyn RpcHook>) -> bool {
        let mut hooks = self.hooks.write();
        if hooks
            .iter()
            .any(|h| std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(&hook)))
        {
            return false;
        }
        hooks.push(hook);
        true
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Returns true if no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn RpcHook>> {
        self.hooks.read().clone()
    }

    /// Runs every `before_request` in registration order.
    pub fn before_request(&self, remote_addr: &str, request: &mut Command) {
        for hook in self.snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook.before_request(remote_addr, request)
            }));
            report(outcome, "before_request", remote_addr, request.code);
        }
    }

    /// Runs every `after_response` in registration order.
    pub fn after_response(&self, remote_addr: &str, request: &Command, response: &Command) {
        for hook in self.snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook.after_response(remote_addr, request, response)
            }));
            report(outcome, "after_response", remote_addr, request.code);
        }
    }
}

fn report(
    outcome: std::thread::Result<Result<()>>,
    stage: &'static str,
    remote_addr: &str,
    code: i32,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(stage, peer = remote_addr, code, error = %e, "rpc hook failed"),
        Err(panic) => error!(
            stage,
            peer = remote_addr,
            code,
            panic = %panic_message(panic.as_ref()),
            "rpc hook panicked"
        ),
    }
}
