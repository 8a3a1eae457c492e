//! Control Capabilities
//!
//! Cancellation, human approval and force-stop are small single-method
//! interfaces injected once at construction. [`Controls`] bundles them for
//! the components that need all three.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Cooperative cancellation check
#[async_trait]
pub trait Canceller: Send + Sync {
    fn is_cancelled(&self) -> bool;

    /// Resolves once cancellation is requested. The default polls.
    async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Resettable cancellation flag shared between a driver and the components
/// that poll it.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request cancellation of the work in flight
    pub fn cancel(&self) {
        self.current().cancel();
    }

    /// Arm a fresh token for the next query
    pub fn reset(&self) {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

#[async_trait]
impl Canceller for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.current().is_cancelled()
    }

    async fn cancelled(&self) {
        self.current().cancelled().await;
    }
}

/// Outcome of the human-approval gate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    Execute,
    /// Returned to the model as a failed tool result
    Reject(String),
}

/// Vetoes tool calls before they start
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, tool: &str, input: &serde_json::Value) -> ApprovalDecision;
}

/// Approves every call
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _tool: &str, _input: &serde_json::Value) -> ApprovalDecision {
        ApprovalDecision::Execute
    }
}

/// Decides whether a hung tool call should be killed after cancellation.
///
/// `finished` fires the instant the call completes on its own, so a prompt
/// shown to an operator can be withdrawn.
#[async_trait]
pub trait ForceStopper: Send + Sync {
    async fn confirm_force_stop(
        &self,
        tool: &str,
        elapsed: Duration,
        finished: CancellationToken,
    ) -> bool;
}

/// Never kills; cancelled calls run to completion
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverForceStop;

#[async_trait]
impl ForceStopper for NeverForceStop {
    async fn confirm_force_stop(&self, _: &str, _: Duration, _: CancellationToken) -> bool {
        false
    }
}

/// Always kills once asked
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysForceStop;

#[async_trait]
impl ForceStopper for AlwaysForceStop {
    async fn confirm_force_stop(&self, _: &str, _: Duration, _: CancellationToken) -> bool {
        true
    }
}

/// The control capabilities of one agent
#[derive(Clone)]
pub struct Controls {
    pub canceller: Arc<dyn Canceller>,
    pub approver: Arc<dyn Approver>,
    pub force_stopper: Arc<dyn ForceStopper>,
}

impl Controls {
    pub fn new(canceller: Arc<dyn Canceller>) -> Self {
        Self {
            canceller,
            approver: Arc::new(AutoApprove),
            force_stopper: Arc::new(NeverForceStop),
        }
    }

    #[must_use]
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    #[must_use]
    pub fn with_force_stopper(mut self, force_stopper: Arc<dyn ForceStopper>) -> Self {
        self.force_stopper = force_stopper;
        self
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new(Arc::new(CancelFlag::new()))
    }
}

impl std::fmt::Debug for Controls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controls")
            .field("cancelled", &self.canceller.is_cancelled())
            .finish_non_exhaustive()
    }
}
