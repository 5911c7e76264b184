// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run context and external shutdown handle.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::stage::StageKind;

/// Fatal fault raised by a stage through [`RunContext::report_fatal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFault {
    pub stage: StageKind,
    pub reason: String,
}

/// Cancellable context passed to every stage's `start` call.
///
/// Stages observe cancellation through [`cancelled`](RunContext::cancelled) or
/// [`is_cancelled`](RunContext::is_cancelled) and derive tokens for their own tasks with
/// [`child_token`](RunContext::child_token). The only way for a stage to cancel the run is
/// [`report_fatal`](RunContext::report_fatal), which also tells the orchestrator why.
#[derive(Debug, Clone)]
pub struct RunContext {
    stage: StageKind,
    token: CancellationToken,
    faults: mpsc::UnboundedSender<StageFault>,
}

impl RunContext {
    pub(crate) fn new(
        stage: StageKind,
        token: CancellationToken,
        faults: mpsc::UnboundedSender<StageFault>,
    ) -> Self {
        Self {
            stage,
            token,
            faults,
        }
    }

    /// A context that is not attached to an orchestrator, for driving a single stage on its
    /// own. The returned handle cancels it.
    #[must_use]
    pub fn standalone(stage: StageKind) -> (Self, AgentHandle) {
        let token = CancellationToken::new();
        let (faults, _) = mpsc::unbounded_channel();
        (
            Self::new(stage, token.clone(), faults),
            AgentHandle {
                shutdown_token: token,
            },
        )
    }

    /// The stage this context was issued to.
    #[must_use]
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Resolves once the run has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token cancelled together with the run, for the stage's internal tasks. Cancelling
    /// it does not affect the run.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Reports an unrecoverable stage fault and cancels the run.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let fault = StageFault {
            stage: self.stage,
            reason: reason.into(),
        };
        error!(stage = %fault.stage, "Fatal stage fault: {}", fault.reason);
        // The receiver is gone once the orchestrator stopped listening; cancelling is what matters.
        let _ = self.faults.send(fault);
        self.token.cancel();
    }
}

/// Handle for requesting shutdown from outside the orchestrator.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    shutdown_token: CancellationToken,
}

impl AgentHandle {
    pub(crate) fn new(shutdown_token: CancellationToken) -> Self {
        Self { shutdown_token }
    }

    /// Request a graceful shutdown of the agent.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}
