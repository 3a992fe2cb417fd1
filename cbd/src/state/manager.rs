//! StateManager - actor that owns the CallStore
//!
//! Processes commands via channels for thread-safe access to persistent
//! state. Every status change flows through the Transition-style commands
//! here, so the read-validate-write cycle is serialized on one task and
//! concurrent writers cannot race each other past the edge table.

use std::cmp::Reverse;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{
    CallStatus, CallbackRequest, Filter, FilterOp, IndexValue, Priority, Record, Store, VerificationCode,
    now_ms,
};
use crate::events::{AuditRecord, CbEvent, EventBus};

use super::messages::{StateCommand, StateError, StateResponse};

/// All statuses, for aggregate counting
const ALL_STATUSES: [CallStatus; 9] = [
    CallStatus::Pending,
    CallStatus::Verified,
    CallStatus::Calling,
    CallStatus::Completed,
    CallStatus::Failed,
    CallStatus::RetryScheduled,
    CallStatus::DeadLetter,
    CallStatus::Cancelled,
    CallStatus::SmsSent,
];

const ALL_PRIORITIES: [Priority; 3] = [Priority::High, Priority::Default, Priority::Low];

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor owning the store at `store_path`
    pub fn spawn(store_path: impl AsRef<Path>, bus: Arc<EventBus>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        // Rebuild indexes for all record types so filtered queries are
        // correct even after indexed_fields() definitions change
        let request_count = store.rebuild_indexes::<CallbackRequest>()?;
        let code_count = store.rebuild_indexes::<VerificationCode>()?;
        let audit_count = store.rebuild_indexes::<AuditRecord>()?;
        info!(request_count, code_count, audit_count, "Rebuilt indexes");

        let (tx, rx) = mpsc::channel(256);

        // Spawn the actor task
        tokio::spawn(actor_loop(store, rx, bus));

        info!("StateManager spawned");

        Ok(Self { tx })
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Request operations ===

    /// Create a new CallbackRequest record
    pub async fn create_request(&self, request: CallbackRequest) -> StateResponse<String> {
        debug!(request_id = %request.id, "create_request: called");
        self.send_command(|reply| StateCommand::CreateRequest { request, reply }).await
    }

    /// Get a CallbackRequest by ID
    pub async fn get_request(&self, id: &str) -> StateResponse<Option<CallbackRequest>> {
        debug!(%id, "get_request: called");
        let id = id.to_string();
        self.send_command(|reply| StateCommand::GetRequest { id, reply }).await
    }

    /// Get a CallbackRequest by ID, returning an error if not found
    pub async fn get_request_required(&self, id: &str) -> StateResponse<CallbackRequest> {
        debug!(%id, "get_request_required: called");
        self.get_request(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Request {}", id)))
    }

    /// List CallbackRequests with an optional status filter
    pub async fn list_requests(&self, status_filter: Option<CallStatus>) -> StateResponse<Vec<CallbackRequest>> {
        debug!(?status_filter, "list_requests: called");
        self.send_command(|reply| StateCommand::ListRequests { status_filter, reply })
            .await
    }

    /// Guarded status transition; returns the updated request
    pub async fn transition(
        &self,
        id: &str,
        to: CallStatus,
        message: impl Into<String>,
        call_ref: Option<String>,
        message_ref: Option<String>,
        expect_from: Option<Vec<CallStatus>>,
    ) -> StateResponse<CallbackRequest> {
        let id = id.to_string();
        let message = message.into();
        debug!(%id, %to, "transition: called");
        self.send_command(|reply| StateCommand::Transition {
            id,
            to,
            message,
            call_ref,
            message_ref,
            expect_from,
            reply,
        })
        .await
    }

    /// Count the failed attempt and book the next one (Failed -> RetryScheduled)
    pub async fn schedule_retry(
        &self,
        id: &str,
        message: impl Into<String>,
        next_retry_at: i64,
    ) -> StateResponse<CallbackRequest> {
        let id = id.to_string();
        let message = message.into();
        debug!(%id, next_retry_at, "schedule_retry: called");
        self.send_command(|reply| StateCommand::ScheduleRetry {
            id,
            message,
            next_retry_at,
            reply,
        })
        .await
    }

    /// Count the final failed attempt and park the request (Failed -> DeadLetter)
    pub async fn dead_letter(&self, id: &str, message: impl Into<String>) -> StateResponse<CallbackRequest> {
        let id = id.to_string();
        let message = message.into();
        debug!(%id, "dead_letter: called");
        self.send_command(|reply| StateCommand::DeadLetter { id, message, reply }).await
    }

    /// Advance the escalation chain on a Calling request
    pub async fn record_escalation(
        &self,
        id: &str,
        target: &str,
        call_ref: Option<String>,
        message: impl Into<String>,
    ) -> StateResponse<CallbackRequest> {
        let id = id.to_string();
        let target = target.to_string();
        let message = message.into();
        debug!(%id, %target, "record_escalation: called");
        self.send_command(|reply| StateCommand::RecordEscalation {
            id,
            target,
            call_ref,
            message,
            reply,
        })
        .await
    }

    // === Counting queries ===

    /// Count requests currently in a status
    pub async fn count_by_status(&self, status: CallStatus) -> StateResponse<u64> {
        debug!(%status, "count_by_status: called");
        self.send_command(|reply| StateCommand::CountByStatus { status, reply }).await
    }

    /// Count requests created at or after `since_ms`
    pub async fn count_created_since(&self, since_ms: i64) -> StateResponse<u64> {
        debug!(since_ms, "count_created_since: called");
        self.send_command(|reply| StateCommand::CountCreatedSince { since_ms, reply })
            .await
    }

    /// Count requests sitting in Verified whose last update is at or after `since_ms`
    pub async fn count_verified_since(&self, since_ms: i64) -> StateResponse<u64> {
        debug!(since_ms, "count_verified_since: called");
        self.send_command(|reply| StateCommand::CountVerifiedSince { since_ms, reply })
            .await
    }

    /// Count requests sharing a fingerprint created at or after `since_ms`
    pub async fn count_by_fingerprint_since(&self, fingerprint: &str, since_ms: i64) -> StateResponse<u64> {
        debug!(since_ms, "count_by_fingerprint_since: called");
        let fingerprint = fingerprint.to_string();
        self.send_command(|reply| StateCommand::CountByFingerprintSince {
            fingerprint,
            since_ms,
            reply,
        })
        .await
    }

    /// Per-status request counts
    pub async fn status_counts(&self) -> StateResponse<Vec<(CallStatus, u64)>> {
        debug!("status_counts: called");
        self.send_command(|reply| StateCommand::StatusCounts { reply }).await
    }

    /// Request counts per priority, high first
    pub async fn priority_counts(&self) -> StateResponse<Vec<(Priority, u64)>> {
        debug!("priority_counts: called");
        self.send_command(|reply| StateCommand::PriorityCounts { reply }).await
    }

    /// Non-terminal requests for a contact created at or after `since_ms`
    pub async fn find_active_by_contact(&self, phone: &str, since_ms: i64) -> StateResponse<Vec<CallbackRequest>> {
        debug!(%phone, since_ms, "find_active_by_contact: called");
        let phone = phone.to_string();
        self.send_command(|reply| StateCommand::FindActiveByContact { phone, since_ms, reply })
            .await
    }

    /// Due retries ordered by priority then age, at most `limit`
    pub async fn list_due_retries(&self, now_ms: i64, limit: usize) -> StateResponse<Vec<CallbackRequest>> {
        debug!(now_ms, limit, "list_due_retries: called");
        self.send_command(|reply| StateCommand::ListDueRetries { now_ms, limit, reply })
            .await
    }

    /// Calling requests whose last update is at or before `cutoff_ms`
    pub async fn list_stale_calling(&self, cutoff_ms: i64) -> StateResponse<Vec<CallbackRequest>> {
        debug!(cutoff_ms, "list_stale_calling: called");
        self.send_command(|reply| StateCommand::ListStaleCalling { cutoff_ms, reply })
            .await
    }

    // === Verification code operations ===

    /// Create a new VerificationCode record
    pub async fn create_code(&self, code: VerificationCode) -> StateResponse<String> {
        debug!(code_id = %code.id, "create_code: called");
        self.send_command(|reply| StateCommand::CreateCode { code, reply }).await
    }

    /// Most recent unverified code for (request, channel), expired or not
    pub async fn get_active_code(&self, request_id: &str, channel: &str) -> StateResponse<Option<VerificationCode>> {
        debug!(%request_id, %channel, "get_active_code: called");
        let request_id = request_id.to_string();
        let channel = channel.to_string();
        self.send_command(|reply| StateCommand::GetActiveCode {
            request_id,
            channel,
            reply,
        })
        .await
    }

    /// Update a VerificationCode record
    pub async fn update_code(&self, code: VerificationCode) -> StateResponse<()> {
        debug!(code_id = %code.id, "update_code: called");
        self.send_command(|reply| StateCommand::UpdateCode { code, reply }).await
    }

    // === Audit operations ===

    /// Persist an audit record (no bus emission; the sink calls this)
    pub async fn record_audit(&self, record: AuditRecord) -> StateResponse<String> {
        debug!(audit_id = %record.id, "record_audit: called");
        self.send_command(|reply| StateCommand::RecordAudit { record, reply }).await
    }

    /// Audit trail for one request, oldest first
    pub async fn list_audit(&self, request_id: &str) -> StateResponse<Vec<AuditRecord>> {
        debug!(%request_id, "list_audit: called");
        let request_id = request_id.to_string();
        self.send_command(|reply| StateCommand::ListAudit { request_id, reply }).await
    }

    /// Stop the actor loop
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>, bus: Arc<EventBus>) {
    debug!("actor_loop: called");
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateRequest { request, reply } => {
                debug!(request_id = %request.id, "actor_loop: CreateRequest command");
                let event = CbEvent::RequestSubmitted {
                    request_id: request.id.clone(),
                    phone: request.phone.clone(),
                    priority: request.priority.to_string(),
                };
                let result = store.create(request).map_err(|e| StateError::StoreError(e.to_string()));
                if result.is_ok() {
                    bus.emit(event);
                }
                let _ = reply.send(result);
            }

            StateCommand::GetRequest { id, reply } => {
                debug!(%id, "actor_loop: GetRequest command");
                let result: StateResponse<Option<CallbackRequest>> =
                    store.get(&id).map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::ListRequests { status_filter, reply } => {
                debug!(?status_filter, "actor_loop: ListRequests command");
                let mut filters = Vec::new();
                if let Some(status) = status_filter {
                    filters.push(status_eq(status));
                }
                let result: StateResponse<Vec<CallbackRequest>> =
                    store.list(&filters).map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::Transition {
                id,
                to,
                message,
                call_ref,
                message_ref,
                expect_from,
                reply,
            } => {
                debug!(%id, %to, "actor_loop: Transition command");
                let result = apply_transition(&mut store, &bus, &id, to, message, call_ref, message_ref, expect_from);
                let _ = reply.send(result);
            }

            StateCommand::ScheduleRetry {
                id,
                message,
                next_retry_at,
                reply,
            } => {
                debug!(%id, "actor_loop: ScheduleRetry command");
                let result = apply_failure_followup(&mut store, &bus, &id, message, Some(next_retry_at));
                let _ = reply.send(result);
            }

            StateCommand::DeadLetter { id, message, reply } => {
                debug!(%id, "actor_loop: DeadLetter command");
                let result = apply_failure_followup(&mut store, &bus, &id, message, None);
                let _ = reply.send(result);
            }

            StateCommand::RecordEscalation {
                id,
                target,
                call_ref,
                message,
                reply,
            } => {
                debug!(%id, %target, "actor_loop: RecordEscalation command");
                let result = apply_escalation(&mut store, &bus, &id, &target, call_ref, message);
                let _ = reply.send(result);
            }

            StateCommand::CountByStatus { status, reply } => {
                debug!(%status, "actor_loop: CountByStatus command");
                let result = store
                    .count::<CallbackRequest>(&[status_eq(status)])
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::CountCreatedSince { since_ms, reply } => {
                debug!(since_ms, "actor_loop: CountCreatedSince command");
                let filter = Filter {
                    field: "created_at".to_string(),
                    op: FilterOp::Ge,
                    value: IndexValue::Integer(since_ms),
                };
                let result = store
                    .count::<CallbackRequest>(&[filter])
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::CountVerifiedSince { since_ms, reply } => {
                debug!(since_ms, "actor_loop: CountVerifiedSince command");
                let result = store
                    .list::<CallbackRequest>(&[status_eq(CallStatus::Verified)])
                    .map(|requests| requests.iter().filter(|r| r.updated_at >= since_ms).count() as u64)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::CountByFingerprintSince {
                fingerprint,
                since_ms,
                reply,
            } => {
                debug!(since_ms, "actor_loop: CountByFingerprintSince command");
                let filters = [
                    Filter {
                        field: "fingerprint".to_string(),
                        op: FilterOp::Eq,
                        value: IndexValue::String(fingerprint),
                    },
                    Filter {
                        field: "created_at".to_string(),
                        op: FilterOp::Ge,
                        value: IndexValue::Integer(since_ms),
                    },
                ];
                let result = store
                    .count::<CallbackRequest>(&filters)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::StatusCounts { reply } => {
                debug!("actor_loop: StatusCounts command");
                let mut counts = Vec::with_capacity(ALL_STATUSES.len());
                let mut failed: Option<StateError> = None;
                for status in ALL_STATUSES {
                    match store.count::<CallbackRequest>(&[status_eq(status)]) {
                        Ok(count) => counts.push((status, count)),
                        Err(e) => {
                            failed = Some(StateError::StoreError(e.to_string()));
                            break;
                        }
                    }
                }
                let result = match failed {
                    Some(e) => Err(e),
                    None => Ok(counts),
                };
                let _ = reply.send(result);
            }

            StateCommand::PriorityCounts { reply } => {
                debug!("actor_loop: PriorityCounts command");
                let mut counts = Vec::with_capacity(ALL_PRIORITIES.len());
                let mut failed: Option<StateError> = None;
                for priority in ALL_PRIORITIES {
                    let filter = Filter {
                        field: "priority".to_string(),
                        op: FilterOp::Eq,
                        value: IndexValue::String(priority.to_string()),
                    };
                    match store.count::<CallbackRequest>(&[filter]) {
                        Ok(count) => counts.push((priority, count)),
                        Err(e) => {
                            failed = Some(StateError::StoreError(e.to_string()));
                            break;
                        }
                    }
                }
                let result = match failed {
                    Some(e) => Err(e),
                    None => Ok(counts),
                };
                let _ = reply.send(result);
            }

            StateCommand::FindActiveByContact { phone, since_ms, reply } => {
                debug!(%phone, "actor_loop: FindActiveByContact command");
                let filter = Filter {
                    field: "phone".to_string(),
                    op: FilterOp::Eq,
                    value: IndexValue::String(phone),
                };
                let result = store
                    .list::<CallbackRequest>(&[filter])
                    .map(|requests| {
                        requests
                            .into_iter()
                            .filter(|r| !r.is_terminal() && r.created_at >= since_ms)
                            .collect()
                    })
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::ListDueRetries { now_ms, limit, reply } => {
                debug!(now_ms, limit, "actor_loop: ListDueRetries command");
                let filters = [
                    status_eq(CallStatus::RetryScheduled),
                    Filter {
                        field: "next_retry_at".to_string(),
                        op: FilterOp::Le,
                        value: IndexValue::Integer(now_ms),
                    },
                ];
                let result = store
                    .list::<CallbackRequest>(&filters)
                    .map(|mut due| {
                        due.sort_by_key(|r| (Reverse(r.priority), r.created_at));
                        due.truncate(limit);
                        due
                    })
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::ListStaleCalling { cutoff_ms, reply } => {
                debug!(cutoff_ms, "actor_loop: ListStaleCalling command");
                let result = store
                    .list::<CallbackRequest>(&[status_eq(CallStatus::Calling)])
                    .map(|calling| calling.into_iter().filter(|r| r.updated_at <= cutoff_ms).collect())
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::CreateCode { code, reply } => {
                debug!(code_id = %code.id, "actor_loop: CreateCode command");
                let result = store.create(code).map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::GetActiveCode {
                request_id,
                channel,
                reply,
            } => {
                debug!(%request_id, %channel, "actor_loop: GetActiveCode command");
                let filters = [
                    Filter {
                        field: "request_id".to_string(),
                        op: FilterOp::Eq,
                        value: IndexValue::String(request_id),
                    },
                    Filter {
                        field: "channel".to_string(),
                        op: FilterOp::Eq,
                        value: IndexValue::String(channel),
                    },
                    Filter {
                        field: "verified".to_string(),
                        op: FilterOp::Eq,
                        value: IndexValue::Integer(0),
                    },
                ];
                let result = store
                    .list::<VerificationCode>(&filters)
                    .map(|codes| codes.into_iter().max_by_key(|c| c.created_at))
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::UpdateCode { code, reply } => {
                debug!(code_id = %code.id, "actor_loop: UpdateCode command");
                let result = store.update(code).map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::RecordAudit { record, reply } => {
                debug!(audit_id = %record.id, "actor_loop: RecordAudit command");
                let result = store.create(record).map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::ListAudit { request_id, reply } => {
                debug!(%request_id, "actor_loop: ListAudit command");
                let filter = Filter {
                    field: "request_id".to_string(),
                    op: FilterOp::Eq,
                    value: IndexValue::String(request_id),
                };
                let result = store
                    .list::<AuditRecord>(&[filter])
                    .map(|mut records| {
                        records.sort_by_key(|r| r.created_at);
                        records
                    })
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

fn status_eq(status: CallStatus) -> Filter {
    Filter {
        field: "status".to_string(),
        op: FilterOp::Eq,
        value: IndexValue::String(status.to_string()),
    }
}

fn load_request(store: &Store, id: &str) -> StateResponse<CallbackRequest> {
    store
        .get::<CallbackRequest>(id)
        .map_err(|e| StateError::StoreError(e.to_string()))?
        .ok_or_else(|| StateError::NotFound(format!("Request {}", id)))
}

/// The guarded transition: re-validates the current persisted status
/// before writing, and writes status + message + refs in one update.
#[allow(clippy::too_many_arguments)]
fn apply_transition(
    store: &mut Store,
    bus: &EventBus,
    id: &str,
    to: CallStatus,
    message: String,
    call_ref: Option<String>,
    message_ref: Option<String>,
    expect_from: Option<Vec<CallStatus>>,
) -> StateResponse<CallbackRequest> {
    let mut request = load_request(store, id)?;
    let from = request.status;

    if let Some(expected) = expect_from
        && !expected.contains(&from)
    {
        return Err(StateError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }
    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }

    if from == CallStatus::RetryScheduled && to == CallStatus::Calling {
        request.consume_retry();
    }
    if let Some(call_ref) = call_ref {
        request.set_call_ref(call_ref);
    }
    if let Some(message_ref) = message_ref {
        request.set_message_ref(message_ref);
    }
    request.set_status(to, message.clone());

    store
        .update(request.clone())
        .map_err(|e| StateError::StoreError(e.to_string()))?;

    bus.emit(CbEvent::StatusChanged {
        request_id: request.id.clone(),
        from,
        to,
        message,
    });
    Ok(request)
}

/// Shared tail of the failure path: count the attempt, then either book
/// the next one (Some(next_retry_at)) or dead-letter (None).
fn apply_failure_followup(
    store: &mut Store,
    bus: &EventBus,
    id: &str,
    message: String,
    next_retry_at: Option<i64>,
) -> StateResponse<CallbackRequest> {
    let mut request = load_request(store, id)?;
    let from = request.status;
    let to = match next_retry_at {
        Some(_) => CallStatus::RetryScheduled,
        None => CallStatus::DeadLetter,
    };

    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }

    match next_retry_at {
        Some(next) => request.schedule_retry(next),
        None => request.record_failed_attempt(),
    }
    request.set_status(to, message.clone());

    store
        .update(request.clone())
        .map_err(|e| StateError::StoreError(e.to_string()))?;

    bus.emit(CbEvent::StatusChanged {
        request_id: request.id.clone(),
        from,
        to,
        message,
    });
    match next_retry_at {
        Some(next) => bus.emit(CbEvent::RetryScheduled {
            request_id: request.id.clone(),
            retry_count: request.retry_count,
            next_retry_at: next,
        }),
        None => bus.emit(CbEvent::DeadLettered {
            request_id: request.id.clone(),
            retry_count: request.retry_count,
        }),
    }
    Ok(request)
}

fn apply_escalation(
    store: &mut Store,
    bus: &EventBus,
    id: &str,
    target: &str,
    call_ref: Option<String>,
    message: String,
) -> StateResponse<CallbackRequest> {
    let mut request = load_request(store, id)?;
    if request.status != CallStatus::Calling {
        return Err(StateError::InvalidTransition {
            id: id.to_string(),
            from: request.status,
            to: CallStatus::Calling,
        });
    }

    request.advance_escalation(target);
    if let Some(call_ref) = call_ref {
        request.set_call_ref(call_ref);
    }
    request.status_message = message;
    request.updated_at = now_ms();

    store
        .update(request.clone())
        .map_err(|e| StateError::StoreError(e.to_string()))?;

    bus.emit(CbEvent::EscalationAdvanced {
        request_id: request.id.clone(),
        level: request.escalation_level,
        target: target.to_string(),
    });
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::events::create_event_bus;
    use tempfile::tempdir;

    async fn spawn_manager(temp: &tempfile::TempDir) -> StateManager {
        StateManager::spawn(temp.path().join("store.db"), create_event_bus()).unwrap()
    }

    #[tokio::test]
    async fn test_request_crud() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        let request = CallbackRequest::with_id("req-1", "+13217047403");
        let id = manager.create_request(request).await.unwrap();
        assert_eq!(id, "req-1");

        let retrieved = manager.get_request("req-1").await.unwrap();
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().phone, "+13217047403");

        let all = manager.list_requests(None).await.unwrap();
        assert_eq!(all.len(), 1);

        let missing = manager.get_request("nope").await.unwrap();
        assert!(missing.is_none());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_happy_path() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();

        let updated = manager
            .transition("req-1", CallStatus::Verified, "Contact verified", None, None, None)
            .await
            .unwrap();
        assert_eq!(updated.status, CallStatus::Verified);
        assert_eq!(updated.status_message, "Contact verified");

        let updated = manager
            .transition(
                "req-1",
                CallStatus::Calling,
                "Calling business",
                Some("CA-123".to_string()),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, CallStatus::Calling);
        assert_eq!(updated.call_ref.as_deref(), Some("CA-123"));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edge() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();

        let result = manager
            .transition("req-1", CallStatus::Completed, "nope", None, None, None)
            .await;
        assert!(matches!(
            result,
            Err(StateError::InvalidTransition {
                from: CallStatus::Pending,
                to: CallStatus::Completed,
                ..
            })
        ));

        // State unchanged after the rejected write
        let request = manager.get_request_required("req-1").await.unwrap();
        assert_eq!(request.status, CallStatus::Pending);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_respects_expect_from() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();

        // Cancel is legal from Pending, but the caller only expects Verified
        let result = manager
            .transition(
                "req-1",
                CallStatus::Cancelled,
                "cancel",
                None,
                None,
                Some(vec![CallStatus::Verified]),
            )
            .await;
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_emits_status_changed() {
        let temp = tempdir().unwrap();
        let bus = create_event_bus();
        let manager = StateManager::spawn(temp.path().join("store.db"), bus.clone()).unwrap();
        let mut rx = bus.subscribe();

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Verified, "Contact verified", None, None, None)
            .await
            .unwrap();

        let submitted = rx.recv().await.unwrap();
        assert_eq!(submitted.kind(), "RequestSubmitted");
        let changed = rx.recv().await.unwrap();
        match changed {
            CbEvent::StatusChanged { from, to, .. } => {
                assert_eq!(from, CallStatus::Pending);
                assert_eq!(to, CallStatus::Verified);
            }
            other => panic!("Expected StatusChanged, got {:?}", other),
        }

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_retry_and_dead_letter() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Verified, "verified", None, None, None)
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Calling, "calling", None, None, None)
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Failed, "no answer", None, None, None)
            .await
            .unwrap();

        let next = now_ms() + 60_000;
        let updated = manager.schedule_retry("req-1", "Retry 1 of 3", next).await.unwrap();
        assert_eq!(updated.status, CallStatus::RetryScheduled);
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.next_retry_at, Some(next));

        // Dispatch the retry, fail again, dead-letter
        manager
            .transition("req-1", CallStatus::Calling, "calling", None, None, None)
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Failed, "busy", None, None, None)
            .await
            .unwrap();
        let updated = manager.dead_letter("req-1", "Retries exhausted").await.unwrap();
        assert_eq!(updated.status, CallStatus::DeadLetter);
        assert_eq!(updated.retry_count, 2);
        assert!(updated.next_retry_at.is_none());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_dispatch_consumes_booking() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();
        for (to, message) in [
            (CallStatus::Verified, "verified"),
            (CallStatus::Calling, "calling"),
            (CallStatus::Failed, "failed"),
        ] {
            manager.transition("req-1", to, message, None, None, None).await.unwrap();
        }
        manager
            .schedule_retry("req-1", "Retry 1 of 3", now_ms() - 1000)
            .await
            .unwrap();

        let updated = manager
            .transition("req-1", CallStatus::Calling, "Calling business", None, None, None)
            .await
            .unwrap();
        assert!(updated.next_retry_at.is_none());
        assert!(updated.last_retry_at.is_some());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_due_retries_orders_by_priority_then_age() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        let now = now_ms();
        for (id, priority, age_ms) in [
            ("req-low", Priority::Low, 30_000),
            ("req-old-default", Priority::Default, 60_000),
            ("req-new-default", Priority::Default, 10_000),
            ("req-high", Priority::High, 5_000),
        ] {
            let mut request = CallbackRequest::with_id(id, "+13217047403").with_priority(priority);
            request.created_at = now - age_ms;
            manager.create_request(request).await.unwrap();
            for (to, message) in [
                (CallStatus::Verified, "verified"),
                (CallStatus::Calling, "calling"),
                (CallStatus::Failed, "failed"),
            ] {
                manager.transition(id, to, message, None, None, None).await.unwrap();
            }
            manager.schedule_retry(id, "retry", now - 1).await.unwrap();
        }

        let due = manager.list_due_retries(now, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["req-high", "req-old-default", "req-new-default", "req-low"]);

        // Batch cap applies after ordering
        let capped = manager.list_due_retries(now, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].id, "req-high");

        // Not-yet-due rows stay out
        let none_due = manager.list_due_retries(now - 120_000, 10).await.unwrap();
        assert!(none_due.is_empty());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_counting_queries() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        let mut request = CallbackRequest::with_id("req-1", "+13217047403").with_origin("203.0.113.9", "curl/8.0");
        let fingerprint = request.fingerprint.clone();
        request.created_at = now_ms();
        manager.create_request(request).await.unwrap();

        assert_eq!(manager.count_by_status(CallStatus::Pending).await.unwrap(), 1);
        assert_eq!(manager.count_by_status(CallStatus::Calling).await.unwrap(), 0);
        assert_eq!(manager.count_created_since(now_ms() - 60_000).await.unwrap(), 1);
        assert_eq!(manager.count_created_since(now_ms() + 60_000).await.unwrap(), 0);
        assert_eq!(
            manager
                .count_by_fingerprint_since(&fingerprint, now_ms() - 60_000)
                .await
                .unwrap(),
            1
        );
        assert_eq!(manager.count_by_fingerprint_since("deadbeef", 0).await.unwrap(), 0);

        let counts = manager.status_counts().await.unwrap();
        let pending = counts.iter().find(|(s, _)| *s == CallStatus::Pending).unwrap();
        assert_eq!(pending.1, 1);

        let priorities = manager.priority_counts().await.unwrap();
        assert_eq!(
            priorities,
            vec![(Priority::High, 0), (Priority::Default, 1), (Priority::Low, 0)]
        );

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_active_by_contact_skips_terminal_and_old() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;
        let now = now_ms();

        let request = CallbackRequest::with_id("req-live", "+13217047403");
        manager.create_request(request).await.unwrap();

        let request = CallbackRequest::with_id("req-done", "+13217047403");
        manager.create_request(request).await.unwrap();
        manager
            .transition("req-done", CallStatus::Cancelled, "cancelled", None, None, None)
            .await
            .unwrap();

        let mut request = CallbackRequest::with_id("req-old", "+13217047403");
        request.created_at = now - 3_600_000 * 2;
        manager.create_request(request).await.unwrap();

        let active = manager
            .find_active_by_contact("+13217047403", now - 3_600_000)
            .await
            .unwrap();
        let ids: Vec<&str> = active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["req-live"]);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_stale_calling() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        manager
            .create_request(CallbackRequest::with_id("req-1", "+13217047403"))
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Verified, "verified", None, None, None)
            .await
            .unwrap();
        manager
            .transition("req-1", CallStatus::Calling, "calling", None, None, None)
            .await
            .unwrap();

        let stale = manager.list_stale_calling(now_ms() + 1000).await.unwrap();
        assert_eq!(stale.len(), 1);

        let fresh = manager.list_stale_calling(now_ms() - 60_000).await.unwrap();
        assert!(fresh.is_empty());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_code_operations() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        let code = VerificationCode::new("req-1", "sms", "+13217047403", "042117", now_ms() + 600_000);
        let code_id = manager.create_code(code).await.unwrap();

        let mut active = manager.get_active_code("req-1", "sms").await.unwrap().unwrap();
        assert_eq!(active.id, code_id);
        assert_eq!(active.code, "042117");

        assert!(manager.get_active_code("req-1", "email").await.unwrap().is_none());
        assert!(manager.get_active_code("req-2", "sms").await.unwrap().is_none());

        // Once verified it no longer comes back as active
        active.mark_verified();
        manager.update_code(active).await.unwrap();
        assert!(manager.get_active_code("req-1", "sms").await.unwrap().is_none());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let temp = tempdir().unwrap();
        let manager = spawn_manager(&temp).await;

        for kind in ["first", "second"] {
            let record = AuditRecord::new(CbEvent::NotificationSent {
                request_id: "req-1".to_string(),
                recipient: "+15550001111".to_string(),
                purpose: kind.to_string(),
            });
            manager.record_audit(record).await.unwrap();
        }

        let trail = manager.list_audit("req-1").await.unwrap();
        assert_eq!(trail.len(), 2);
        match &trail[0].event {
            CbEvent::NotificationSent { purpose, .. } => assert_eq!(purpose, "first"),
            other => panic!("Unexpected event {:?}", other),
        }

        assert!(manager.list_audit("req-2").await.unwrap().is_empty());

        manager.shutdown().await.unwrap();
    }
}
