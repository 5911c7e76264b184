// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # SIEM Agent Core
//!
//! Lifecycle orchestration for the host-resident SIEM agent. This crate owns the parts of
//! the agent that do not care what a log line looks like:
//!
//! - [`identity`]: resolves the agent instance identifier (operator override, CSPRNG, or a
//!   timestamp fallback that never fails)
//! - [`stage`]: the contract every collaborator stage implements
//! - [`pipeline`]: typed, take-once endpoints and the `connect` operation used for wiring
//! - [`context`]: the cancellable run context handed to every stage
//! - [`signals`]: the signal gateway turning SIGINT/SIGTERM into a single wake event
//! - [`orchestrator`]: the state machine driving construction, start, wiring, wait and the
//!   deadline-bounded reverse-order shutdown
//!
//! Concrete collectors, processors, senders and monitors live in other crates and plug in
//! through [`stage::PipelineFactory`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod build_info;
pub mod context;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod pipeline;
pub mod signals;
pub mod stage;

pub use build_info::BuildInfo;
pub use context::{AgentHandle, RunContext, StageFault};
pub use error::{AgentError, StageError};
pub use identity::AgentIdentity;
pub use orchestrator::{
    LifecycleState, Orchestrator, OrchestratorOptions, ShutdownReason, ShutdownReport,
};
pub use signals::{ShutdownSignal, SignalGateway, SignalTrigger};
pub use stage::{Consumer, PipelineFactory, Producer, Stage, StageKind};
