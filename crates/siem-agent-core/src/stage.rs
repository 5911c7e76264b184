// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contracts between the orchestrator and its collaborator stages.

use std::fmt;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::StageError;
use crate::identity::AgentIdentity;
use crate::pipeline::{InputEndpoint, OutputEndpoint};

/// The four lifecycle-managed stages, in construction and start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Collector,
    Processor,
    Sender,
    Monitor,
}

impl StageKind {
    /// Construction and start order. Stop order is the reverse.
    pub const START_ORDER: [StageKind; 4] = [
        StageKind::Collector,
        StageKind::Processor,
        StageKind::Sender,
        StageKind::Monitor,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Collector => "collector",
            StageKind::Processor => "processor",
            StageKind::Sender => "sender",
            StageKind::Monitor => "monitor",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit with an independent start/stop lifecycle.
///
/// The orchestrator is the only caller of `start` and `stop`. `stop` must be idempotent:
/// calling it on a stage that is already stopped, or was never started, returns `Ok(())`.
/// Both calls are expected to return in bounded time; the orchestrator's shutdown budget
/// is only the outer bound.
#[async_trait]
pub trait Stage: Send {
    /// Begins operating. Long-running work is spawned onto the runtime; this returns once
    /// the stage is ready to accept or produce data.
    async fn start(&mut self, ctx: RunContext) -> Result<(), StageError>;

    /// Releases everything acquired by `start`.
    async fn stop(&mut self) -> Result<(), StageError>;
}

/// A stage that produces records for the next stage.
pub trait Producer {
    type Output: Send + 'static;

    /// Hands out the output endpoint. Returns `Some` exactly once.
    fn output_endpoint(&mut self) -> Option<OutputEndpoint<Self::Output>>;
}

/// A stage that consumes records from the previous stage.
pub trait Consumer {
    type Input: Send + 'static;

    /// Hands out the input endpoint. Returns `Some` exactly once.
    fn input_endpoint(&mut self) -> Option<InputEndpoint<Self::Input>>;
}

/// Builds the four stages from configuration.
///
/// Construction validates configuration and allocates in-memory structures only: no
/// sockets, files or tasks. Adjacent stages must agree on their record type, which the
/// associated type bounds check at compile time.
pub trait PipelineFactory {
    type Collector: Stage + Producer + 'static;
    type Processor: Stage
        + Consumer<Input = <Self::Collector as Producer>::Output>
        + Producer
        + 'static;
    type Sender: Stage + Consumer<Input = <Self::Processor as Producer>::Output> + 'static;
    type Monitor: Stage + 'static;

    fn collector(&self) -> Result<Self::Collector, StageError>;

    fn processor(&self) -> Result<Self::Processor, StageError>;

    fn sender(&self, identity: &AgentIdentity) -> Result<Self::Sender, StageError>;

    fn monitor(&self, identity: &AgentIdentity) -> Result<Self::Monitor, StageError>;
}
