//! Invocation engine: correlation table, call modes and request dispatch.
//!
//! Every tracked call is a [`PendingCall`] in the [`ResponseTable`]. A call
//! leaves the table exactly once, through whichever of response arrival,
//! deadline expiry, send failure or channel close removes it first, and only
//! that path completes it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelId};
use crate::drain::DrainController;
use crate::error::{RemotingError, Result};
use crate::metrics::RemotingMetrics;
use crate::processor::{HookChain, Processor, ProcessorEntry, ProcessorTable, RpcHook};
use crate::protocol::{response_code, Command, CommandFlags, REQUEST_CODE_HEADER};
use crate::scheduler::{panic_message, ElasticScheduler, Job};

/// Lifecycle of a pending call. Only the transition out of `Pending` is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    /// Waiting for a response.
    Pending = 0,
    /// Resolved by a response or a send failure.
    Completed = 1,
    /// Resolved by deadline expiry.
    TimedOut = 2,
    /// Resolved because its channel closed.
    Cancelled = 3,
}

impl From<u8> for CallState {
    fn from(value: u8) -> Self {
        match value {
            1 => CallState::Completed,
            2 => CallState::TimedOut,
            3 => CallState::Cancelled,
            _ => CallState::Pending,
        }
    }
}

/// Receives the outcome of a callback-mode call on a scheduler worker.
pub type ResponseCallback = Box<dyn FnOnce(Result<Command>) + Send + 'static>;

enum Completion {
    Waiter(oneshot::Sender<Result<Command>>),
    Callback {
        callback: ResponseCallback,
        scheduler: Arc<ElasticScheduler>,
    },
}

/// A request awaiting its response.
pub struct PendingCall {
    correlation_id: i32,
    channel_id: ChannelId,
    remote_addr: String,
    created_at: Instant,
    deadline: Instant,
    timeout: Duration,
    state: AtomicU8,
    completion: Mutex<Option<Completion>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id)
            .field("channel_id", &self.channel_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PendingCall {
    fn new(
        correlation_id: i32,
        channel: &Channel,
        timeout: Duration,
        completion: Completion,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let created_at = Instant::now();
        let deadline = created_at
            .checked_add(timeout)
            .unwrap_or(created_at + Duration::from_secs(86_400 * 365));
        Self {
            correlation_id,
            channel_id: channel.id(),
            remote_addr: channel.peer_addr().to_string(),
            created_at,
            deadline,
            timeout,
            state: AtomicU8::new(CallState::Pending as u8),
            completion: Mutex::new(Some(completion)),
            permit: Mutex::new(permit),
        }
    }

    /// Correlation id carried by the request.
    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    /// Channel the request was sent on.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Peer the request was sent to.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Absolute expiry time.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time since registration.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current state.
    pub fn state(&self) -> CallState {
        CallState::from(self.state.load(Ordering::Acquire))
    }

    fn timeout_error(&self) -> RemotingError {
        RemotingError::Timeout {
            addr: self.remote_addr.clone(),
            correlation_id: self.correlation_id,
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn cancelled_error(&self) -> RemotingError {
        RemotingError::Cancelled {
            addr: self.remote_addr.clone(),
            correlation_id: self.correlation_id,
        }
    }

    /// Moves out of `Pending` into `state` and delivers `result`.
    ///
    /// Returns false, doing nothing, if another path already resolved the call.
    fn finish(&self, state: CallState, result: Result<Command>) -> bool {
        if self
            .state
            .compare_exchange(
                CallState::Pending as u8,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        drop(self.permit.lock().take());
        let completion = self.completion.lock().take();
        match completion {
            Some(Completion::Waiter(tx)) => {
                let _ = tx.send(result);
            }
            Some(Completion::Callback { callback, scheduler }) => {
                let job: Job = Box::new(move || callback(result));
                if let Err(job) = scheduler.submit(job) {
                    warn!(
                        correlation_id = self.correlation_id,
                        "callback scheduler stopped, running callback inline"
                    );
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        error!(
                            correlation_id = self.correlation_id,
                            panic = %panic_message(panic.as_ref()),
                            "response callback panicked"
                        );
                    }
                }
            }
            None => {}
        }
        true
    }
}

/// Correlation id to pending call mapping.
pub struct ResponseTable {
    calls: DashMap<i32, Arc<PendingCall>>,
    next_id: AtomicI32,
}

impl Default for ResponseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Allocates an id not held by any pending call and inserts the call
    /// built for it.
    fn register(&self, make: impl FnOnce(i32) -> PendingCall) -> Arc<PendingCall> {
        loop {
            // wraps at i32::MAX; ids still held by a live call are skipped
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                let call = Arc::new(make(id));
                slot.insert(Arc::clone(&call));
                return call;
            }
        }
    }

    /// Removes the call for `correlation_id`. Only one caller ever gets it.
    pub fn remove(&self, correlation_id: i32) -> Option<Arc<PendingCall>> {
        self.calls.remove(&correlation_id).map(|(_, call)| call)
    }

    /// Removes every call whose deadline is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<PendingCall>> {
        let overdue: Vec<i32> = self
            .calls
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();
        overdue
            .into_iter()
            .filter_map(|id| self.calls.remove_if(&id, |_, call| call.deadline <= now))
            .map(|(_, call)| call)
            .collect()
    }

    /// Removes every call sent on `channel_id`.
    pub fn take_channel(&self, channel_id: ChannelId) -> Vec<Arc<PendingCall>> {
        let ids: Vec<i32> = self
            .calls
            .iter()
            .filter(|e| e.value().channel_id == channel_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.calls.remove_if(&id, |_, call| call.channel_id == channel_id))
            .map(|(_, call)| call)
            .collect()
    }

    /// Returns true if `correlation_id` is pending.
    pub fn contains(&self, correlation_id: i32) -> bool {
        self.calls.contains_key(&correlation_id)
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Sends requests in the three call modes and dispatches inbound commands.
///
/// Shared by the server and client; all state is internally synchronized.
pub struct InvocationEngine {
    responses: Arc<ResponseTable>,
    processors: ProcessorTable,
    hooks: Arc<HookChain>,
    permits_async: Arc<Semaphore>,
    permits_oneway: Arc<Semaphore>,
    scheduler: Arc<ElasticScheduler>,
    metrics: Arc<RemotingMetrics>,
    drain: Arc<DrainController>,
}

impl std::fmt::Debug for InvocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationEngine")
            .field("pending", &self.responses.len())
            .field("processors", &self.processors.len())
            .field("hooks", &self.hooks.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl InvocationEngine {
    /// Creates an engine. `scheduler` runs callbacks and processors
    /// registered without their own scheduler.
    pub fn new(
        permits_async: usize,
        permits_oneway: usize,
        scheduler: Arc<ElasticScheduler>,
        metrics: Arc<RemotingMetrics>,
    ) -> Self {
        Self {
            responses: Arc::new(ResponseTable::new()),
            processors: ProcessorTable::new(),
            hooks: Arc::new(HookChain::new()),
            permits_async: Arc::new(Semaphore::new(permits_async)),
            permits_oneway: Arc::new(Semaphore::new(permits_oneway)),
            scheduler,
            metrics,
            drain: Arc::new(DrainController::new()),
        }
    }

    /// Registers `processor` for `code` on `scheduler`, or on the engine's
    /// scheduler when `None`.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn Processor>,
        scheduler: Option<Arc<ElasticScheduler>>,
    ) {
        let entry = ProcessorEntry {
            processor,
            scheduler: scheduler.unwrap_or_else(|| Arc::clone(&self.scheduler)),
        };
        if self.processors.register(code, entry).is_some() {
            info!(code, "replaced processor");
        }
    }

    /// Registers the processor serving unmapped codes.
    pub fn register_default_processor(
        &self,
        processor: Arc<dyn Processor>,
        scheduler: Option<Arc<ElasticScheduler>>,
    ) {
        self.processors.register_default(ProcessorEntry {
            processor,
            scheduler: scheduler.unwrap_or_else(|| Arc::clone(&self.scheduler)),
        });
    }

    /// Registered processor and scheduler for `code`, without fallback.
    pub fn processor_pair(&self, code: i32) -> Option<ProcessorEntry> {
        self.processors.get(code)
    }

    /// Appends a hook. Registering the same instance twice is a no-op.
    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        if !self.hooks.register(hook) {
            debug!("rpc hook already registered");
        }
    }

    /// Sends `request` and waits for its response or `timeout`.
    pub async fn invoke_sync(
        &self,
        channel: &Channel,
        mut request: Command,
        timeout: Duration,
    ) -> Result<Command> {
        self.hooks.before_request(channel.peer_addr(), &mut request);

        let (tx, mut rx) = oneshot::channel();
        let call = self.responses.register(|id| {
            PendingCall::new(id, channel, timeout, Completion::Waiter(tx), None)
        });
        let correlation_id = call.correlation_id;
        let deadline = tokio::time::Instant::from_std(call.deadline);
        drop(call);

        request.correlation_id = correlation_id;
        request.flags = request.flags.without(CommandFlags::RESPONSE).without(CommandFlags::ONEWAY);
        let hooked_request = (!self.hooks.is_empty()).then(|| request.clone());
        self.send_tracked(channel, request, correlation_id);

        let result = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(self.closed_error(channel, correlation_id))),
            Err(_) => {
                if let Some(call) = self.responses.remove(correlation_id) {
                    if call.finish(CallState::TimedOut, Err(call.timeout_error())) {
                        self.metrics.inc_timeouts();
                        debug!(correlation_id, peer = channel.peer_addr(), "sync call timed out");
                    }
                }
                // whichever path removed the call has already sent into rx
                rx.await.unwrap_or_else(|_| Err(self.closed_error(channel, correlation_id)))
            }
        };

        if let (Some(request), Ok(response)) = (&hooked_request, &result) {
            self.hooks.after_response(channel.peer_addr(), request, response);
        }
        result
    }

    /// Sends `request` and returns at once; `callback` later receives the
    /// response or error on a scheduler worker.
    ///
    /// Fails with `SystemBusy` without sending, and without calling
    /// `callback`, when no async permit is free.
    pub fn invoke_async<F>(
        &self,
        channel: &Channel,
        mut request: Command,
        timeout: Duration,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Command>) + Send + 'static,
    {
        let permit = Arc::clone(&self.permits_async)
            .try_acquire_owned()
            .map_err(|_| {
                self.metrics.inc_busy_rejections();
                RemotingError::SystemBusy {
                    reason: format!(
                        "async permits exhausted, {} calls in flight",
                        self.responses.len()
                    ),
                }
            })?;

        self.hooks.before_request(channel.peer_addr(), &mut request);
        let callback = self.wrap_callback(channel.peer_addr(), &request, callback);

        let call = self.responses.register(|id| {
            PendingCall::new(
                id,
                channel,
                timeout,
                Completion::Callback {
                    callback,
                    scheduler: Arc::clone(&self.scheduler),
                },
                Some(permit),
            )
        });
        let correlation_id = call.correlation_id;
        drop(call);

        request.correlation_id = correlation_id;
        request.flags = request.flags.without(CommandFlags::RESPONSE).without(CommandFlags::ONEWAY);
        self.send_tracked(channel, request, correlation_id);
        Ok(())
    }

    /// Sends `request` without expecting a response.
    ///
    /// Waits up to `timeout` for a one-way permit, then fails with
    /// `SystemBusy`. The permit is held until the frame is written. Write
    /// failures are logged, not returned.
    pub async fn invoke_oneway(
        &self,
        channel: &Channel,
        mut request: Command,
        timeout: Duration,
    ) -> Result<()> {
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.permits_oneway).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                self.metrics.inc_busy_rejections();
                return Err(RemotingError::SystemBusy {
                    reason: format!("no one-way permit within {}ms", timeout.as_millis()),
                });
            }
        };

        self.hooks.before_request(channel.peer_addr(), &mut request);
        request.correlation_id = self.responses.next_id.fetch_add(1, Ordering::Relaxed);
        request.flags = request.flags.without(CommandFlags::RESPONSE).with(CommandFlags::ONEWAY);

        let metrics = Arc::clone(&self.metrics);
        let peer = channel.peer_addr().to_string();
        let correlation_id = request.correlation_id;
        let queued = channel.write_with(request, move |written| {
            drop(permit);
            match written {
                Ok(()) => metrics.inc_oneway_sent(),
                Err(e) => {
                    metrics.inc_send_failures();
                    warn!(correlation_id, peer = %peer, error = %e, "one-way send failed");
                }
            }
        });
        if let Err(e) = queued {
            self.metrics.inc_send_failures();
            warn!(correlation_id, peer = channel.peer_addr(), error = %e, "one-way send failed");
        }
        Ok(())
    }

    /// Entry point for every decoded inbound command.
    pub fn process_command(&self, channel: &Channel, command: Command) {
        if command.is_response() {
            self.process_response(channel, command);
        } else {
            self.process_request(channel, command);
        }
    }

    fn process_response(&self, channel: &Channel, response: Command) {
        let correlation_id = response.correlation_id;
        match self.responses.remove(correlation_id) {
            Some(call) => {
                if call.finish(CallState::Completed, Ok(response)) {
                    self.metrics.inc_responses_received();
                }
            }
            None => {
                self.metrics.inc_responses_discarded();
                debug!(
                    correlation_id,
                    peer = channel.peer_addr(),
                    "discarding response with no pending call"
                );
            }
        }
    }

    fn process_request(&self, channel: &Channel, mut request: Command) {
        self.metrics.inc_requests_received();
        let oneway = request.is_oneway();
        let correlation_id = request.correlation_id;
        let code = request.code;

        let Some(entry) = self.processors.lookup(code) else {
            self.metrics.inc_unsupported_codes();
            if oneway {
                debug!(code, peer = channel.peer_addr(), "no processor for one-way request");
            } else {
                warn!(code, peer = channel.peer_addr(), "request code not supported");
                let response = Command::error_response(
                    response_code::REQUEST_CODE_NOT_SUPPORTED,
                    correlation_id,
                    format!("request code {} not supported", code),
                )
                .with_header(REQUEST_CODE_HEADER, code.to_string());
                send_response(channel, response, &self.metrics);
            }
            return;
        };

        let Some(guard) = self.drain.try_acquire() else {
            self.metrics.inc_busy_rejections();
            if !oneway {
                send_response(
                    channel,
                    Command::error_response(response_code::SYSTEM_BUSY, correlation_id, "shutting down"),
                    &self.metrics,
                );
            }
            return;
        };

        let hooks = Arc::clone(&self.hooks);
        let metrics = Arc::clone(&self.metrics);
        let job_channel = channel.clone();
        let processor = Arc::clone(&entry.processor);
        let job: Job = Box::new(move || {
            let _guard = guard;
            let peer = job_channel.peer_addr();
            hooks.before_request(peer, &mut request);
            let hooked_request = (!hooks.is_empty()).then(|| request.clone());

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| processor.process(&job_channel, request)));
            let response = match outcome {
                Ok(Ok(Some(mut response))) => {
                    response.correlation_id = correlation_id;
                    response.flags = response.flags.with(CommandFlags::RESPONSE);
                    Some(response)
                }
                Ok(Ok(None)) => None,
                Ok(Err(e)) => {
                    warn!(code, correlation_id, peer, error = %e, "processor failed");
                    Some(Command::error_response(
                        response_code::SYSTEM_ERROR,
                        correlation_id,
                        e.to_string(),
                    ))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(code, correlation_id, peer, panic = %message, "processor panicked");
                    Some(Command::error_response(
                        response_code::SYSTEM_ERROR,
                        correlation_id,
                        format!("processor panicked: {}", message),
                    ))
                }
            };

            if oneway {
                if response.is_some() {
                    debug!(code, peer, "discarding result of one-way request");
                }
                return;
            }
            if let Some(response) = response {
                if let Some(request) = &hooked_request {
                    hooks.after_response(peer, request, &response);
                }
                send_response(&job_channel, response, &metrics);
            }
        });

        if entry.scheduler.submit(job).is_err() {
            self.metrics.inc_busy_rejections();
            warn!(code, scheduler = entry.scheduler.name(), "processor scheduler rejected request");
            if !oneway {
                send_response(
                    channel,
                    Command::error_response(
                        response_code::SYSTEM_BUSY,
                        correlation_id,
                        "processor scheduler unavailable",
                    ),
                    &self.metrics,
                );
            }
        }
    }

    /// Resolves every call pending on `channel` with `Cancelled`.
    pub fn cancel_channel(&self, channel: &Channel) -> usize {
        let calls = self.responses.take_channel(channel.id());
        let cancelled = calls
            .iter()
            .filter(|call| call.finish(CallState::Cancelled, Err(call.cancelled_error())))
            .count();
        if cancelled > 0 {
            self.metrics.add_cancelled(cancelled as u64);
            info!(channel = channel.id(), peer = channel.peer_addr(), cancelled, "cancelled pending calls on close");
        }
        cancelled
    }

    /// Expires overdue calls with `Timeout`; returns how many expired.
    pub fn scan_response_table(&self) -> usize {
        let expired = self.responses.take_expired(Instant::now());
        let mut count = 0;
        for call in expired {
            if call.finish(CallState::TimedOut, Err(call.timeout_error())) {
                count += 1;
                self.metrics.inc_timeouts();
                debug!(
                    correlation_id = call.correlation_id,
                    peer = %call.remote_addr,
                    elapsed_ms = call.elapsed().as_millis() as u64,
                    "pending call expired"
                );
            }
        }
        if count > 0 {
            warn!(expired = count, "response table sweep expired calls");
        }
        count
    }

    /// Runs the expiry sweep every `period` until `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.scan_response_table();
                    }
                }
            }
            debug!("response table sweeper stopped");
        })
    }

    /// The pending-call table.
    pub fn responses(&self) -> &ResponseTable {
        &self.responses
    }

    /// The processor table.
    pub fn processors(&self) -> &ProcessorTable {
        &self.processors
    }

    /// Default scheduler for callbacks and processors.
    pub fn scheduler(&self) -> &Arc<ElasticScheduler> {
        &self.scheduler
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<RemotingMetrics> {
        &self.metrics
    }

    /// Drain controller guarding dispatched requests.
    pub fn drain(&self) -> &Arc<DrainController> {
        &self.drain
    }

    /// Free async permits.
    pub fn available_async_permits(&self) -> usize {
        self.permits_async.available_permits()
    }

    /// Free one-way permits.
    pub fn available_oneway_permits(&self) -> usize {
        self.permits_oneway.available_permits()
    }

    fn wrap_callback<F>(&self, peer: &str, request: &Command, callback: F) -> ResponseCallback
    where
        F: FnOnce(Result<Command>) + Send + 'static,
    {
        if self.hooks.is_empty() {
            return Box::new(callback);
        }
        let hooks = Arc::clone(&self.hooks);
        let peer = peer.to_string();
        let request = request.clone();
        Box::new(move |result: Result<Command>| {
            if let Ok(response) = &result {
                hooks.after_response(&peer, &request, response);
            }
            callback(result)
        })
    }

    // Queues a tracked request; a failed write resolves the call with SendFailure.
    fn send_tracked(&self, channel: &Channel, request: Command, correlation_id: i32) {
        let responses = Arc::clone(&self.responses);
        let metrics = Arc::clone(&self.metrics);
        let peer = channel.peer_addr().to_string();
        let queued = channel.write_with(request, move |written| match written {
            Ok(()) => metrics.inc_requests_sent(),
            Err(e) => fail_send(&responses, &metrics, correlation_id, &peer, e),
        });
        if let Err(e) = queued {
            fail_send(&self.responses, &self.metrics, correlation_id, channel.peer_addr(), e);
        }
    }

    fn closed_error(&self, channel: &Channel, correlation_id: i32) -> RemotingError {
        RemotingError::Cancelled {
            addr: channel.peer_addr().to_string(),
            correlation_id,
        }
    }
}

fn fail_send(
    responses: &ResponseTable,
    metrics: &RemotingMetrics,
    correlation_id: i32,
    peer: &str,
    cause: RemotingError,
) {
    let Some(call) = responses.remove(correlation_id) else {
        return;
    };
    let error = RemotingError::SendFailure {
        addr: peer.to_string(),
        reason: cause.to_string(),
    };
    if call.finish(CallState::Completed, Err(error)) {
        metrics.inc_send_failures();
        warn!(correlation_id, peer, error = %cause, "failed to send request");
    }
}

fn send_response(channel: &Channel, response: Command, metrics: &RemotingMetrics) {
    let correlation_id = response.correlation_id;
    match channel.write_and_forget(response) {
        Ok(()) => metrics.inc_responses_sent(),
        Err(e) => warn!(
            correlation_id,
            peer = channel.peer_addr(),
            error = %e,
            "failed to send response"
        ),
    }
}
