// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::stage::StageKind;

/// Error type crossing the collaborator seam.
///
/// Stages come from different crates with their own error enums; boxing keeps the
/// orchestrator independent of all of them.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that end an agent run before it reaches `Running`.
///
/// Stop errors and an exceeded shutdown deadline are deliberately absent: they are
/// recorded in the [`ShutdownReport`](crate::ShutdownReport) instead.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to create {stage}: {source}")]
    Construction {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    #[error("{stage} did not provide its {endpoint} endpoint")]
    Wiring {
        stage: StageKind,
        endpoint: &'static str,
    },

    #[error("failed to start {stage}: {source}")]
    Start {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}

impl AgentError {
    /// The stage the error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            AgentError::Construction { stage, .. }
            | AgentError::Wiring { stage, .. }
            | AgentError::Start { stage, .. } => Some(*stage),
            AgentError::Signal(_) => None,
        }
    }
}
