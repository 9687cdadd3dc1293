use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use agent_core::{AgentEvent, ApprovalCategory};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ApprovalError, ApprovalPolicy};

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolved ids remembered for "already processed" answers.
const RESOLVED_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolApproval {
    pub id: String,
    pub tool_name: String,
    pub command: String,
    pub category: ApprovalCategory,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
}

/// Body of an approve/deny request from a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    AutoApproved,
    Approved,
    Denied,
    TimedOut,
    Cancelled,
}

impl ApprovalOutcome {
    /// Tool result text for a call that will not run.
    pub fn denial_message(self, command: &str) -> Option<String> {
        match self {
            ApprovalOutcome::AutoApproved | ApprovalOutcome::Approved => None,
            ApprovalOutcome::Denied => Some(format!("Error: user denied execution of '{command}'")),
            ApprovalOutcome::TimedOut => Some(format!(
                "Error: approval for '{command}' timed out; the command was not run"
            )),
            ApprovalOutcome::Cancelled => Some(format!(
                "Error: approval for '{command}' was cancelled; the command was not run"
            )),
        }
    }
}

/// What [`ApprovalGate::request`] decided, with the command as the human saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalVerdict {
    pub command: String,
    pub category: ApprovalCategory,
    pub outcome: ApprovalOutcome,
}

impl ApprovalVerdict {
    pub fn denial_message(&self) -> Option<String> {
        self.outcome.denial_message(&self.command)
    }
}

struct PendingEntry {
    approval: PendingToolApproval,
    responder: Option<oneshot::Sender<bool>>,
}

#[derive(Default)]
struct ResolvedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ResolvedIds {
    fn insert(&mut self, id: String) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Suspends tool calls until a human decides, the deadline passes or the
/// run is cancelled.
pub struct ApprovalGate {
    policy: ApprovalPolicy,
    timeout: Duration,
    pending: RwLock<HashMap<String, PendingEntry>>,
    resolved: Mutex<ResolvedIds>,
}

/// Removes the pending record when the waiting request finishes or is dropped.
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // Recorded first so a racing decision never sees the id as unknown.
        self.gate.resolved.lock().insert(self.id.clone());
        if self.gate.pending.write().remove(&self.id).is_some() {
            log::debug!("approval {} removed from pending table", self.id);
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalPolicy::default())
    }
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            timeout: DEFAULT_APPROVAL_TIMEOUT,
            pending: RwLock::new(HashMap::new()),
            resolved: Mutex::new(ResolvedIds::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn classify(&self, tool_name: &str, arguments: &Value) -> (String, ApprovalCategory) {
        self.policy.classify(tool_name, arguments)
    }

    /// Wait for permission to run `tool_name` with `arguments`.
    ///
    /// Auto-approved categories return at once without a pending record.
    /// Otherwise an `approval_required` event goes out on `events` and the
    /// call waits for [`ApprovalGate::decide`], the timeout or `cancel`.
    pub async fn request(
        &self,
        tool_name: &str,
        arguments: &Value,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> ApprovalVerdict {
        let (command, category) = self.classify(tool_name, arguments);
        if self.policy.is_auto_approved(category) {
            log::debug!("auto-approved {} command: {}", category, command);
            return ApprovalVerdict {
                command,
                category,
                outcome: ApprovalOutcome::AutoApproved,
            };
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (responder, decision) = oneshot::channel();
        let approval = PendingToolApproval {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            command: command.clone(),
            category,
            arguments: arguments.clone(),
            created_at: Utc::now(),
        };
        self.pending.write().insert(
            id.clone(),
            PendingEntry {
                approval,
                responder: Some(responder),
            },
        );
        let _guard = PendingGuard {
            gate: self,
            id: id.clone(),
        };

        log::info!("approval {} required for {} command: {}", id, category, command);
        let event = AgentEvent::ApprovalRequired {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            command: command.clone(),
            category,
        };
        if events.send(event).await.is_err() {
            log::warn!("approval {} published with no event listener", id);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ApprovalOutcome::Cancelled,
            decision = decision => match decision {
                Ok(true) => ApprovalOutcome::Approved,
                Ok(false) => ApprovalOutcome::Denied,
                Err(_) => ApprovalOutcome::Denied,
            },
            _ = tokio::time::sleep(self.timeout) => ApprovalOutcome::TimedOut,
        };

        log::info!("approval {} resolved: {:?}", id, outcome);
        ApprovalVerdict {
            command,
            category,
            outcome,
        }
    }

    /// Resolve one pending approval.
    pub fn decide(&self, id: &str, approved: bool) -> Result<(), ApprovalError> {
        let responder = {
            let mut pending = self.pending.write();
            match pending.get_mut(id) {
                Some(entry) => entry.responder.take(),
                None if self.resolved.lock().contains(id) => {
                    return Err(ApprovalError::AlreadyProcessed(id.to_string()))
                }
                None => return Err(ApprovalError::NotFound(id.to_string())),
            }
        };

        let Some(responder) = responder else {
            return Err(ApprovalError::AlreadyProcessed(id.to_string()));
        };
        // The waiter may have timed out between our lookup and this send.
        responder
            .send(approved)
            .map_err(|_| ApprovalError::AlreadyProcessed(id.to_string()))
    }

    pub fn apply(&self, decision: &ApprovalDecision) -> Result<(), ApprovalError> {
        self.decide(&decision.id, decision.approved)
    }

    /// Approvals still waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<PendingToolApproval> {
        let mut pending: Vec<PendingToolApproval> = self
            .pending
            .read()
            .values()
            .filter(|entry| entry.responder.is_some())
            .map(|entry| entry.approval.clone())
            .collect();
        pending.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        pending
    }
}
