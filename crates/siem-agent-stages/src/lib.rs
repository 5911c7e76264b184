// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # SIEM Agent Stages
//!
//! The concrete stages the agent runs, plus the configuration they are built from.
//!
//! ```text
//!   files / syslog ──► Collector ──RawEvent──► Processor ──SecurityEvent──► Sender ──► backend
//!                                                                                        ▲
//!   /proc/self ──────► Monitor ─────────────── heartbeat ────────────────────────────────┘
//! ```
//!
//! - [`collector`]: tails log files and receives syslog datagrams
//! - [`processor`]: processing rules, classification and normalization
//! - [`sender`]: batching, compression and delivery with retries
//! - [`monitor`]: self resource sampling and heartbeats
//! - [`config`]: layered configuration (defaults, YAML, environment)
//! - [`factory`]: [`AgentPipeline`], which builds the four stages for the orchestrator

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod collector;
pub mod config;
pub mod factory;
pub mod http;
pub mod monitor;
pub mod proc;
pub mod processor;
pub mod record;
pub mod sender;

mod tasks;

pub use config::{AgentConfig, ConfigError};
pub use factory::AgentPipeline;
pub use record::{Category, EventSource, RawEvent, SecurityEvent, Severity};
