// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records flowing through the pipeline.
//!
//! `RawEvent` goes collector → processor, `SecurityEvent` goes processor → sender and is
//! what the backend receives.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where a raw line came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "origin", rename_all = "snake_case")]
pub enum EventSource {
    /// A tailed file, by path.
    File(String),
    /// A syslog datagram, by peer address.
    Syslog(String),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::File(path) => write!(f, "file:{path}"),
            EventSource::Syslog(peer) => write!(f, "syslog:{peer}"),
        }
    }
}

/// One line as collected, untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub source: EventSource,
    pub line: String,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    #[must_use]
    pub fn new(source: EventSource, line: impl Into<String>) -> Self {
        Self {
            source,
            line: line.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Authentication,
    FileAccess,
    NetworkActivity,
    SystemEvent,
    ApplicationLog,
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A normalized event as shipped to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub severity: Severity,
    pub message: String,
    pub source: EventSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    pub host: String,
    /// Stamped by the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}
