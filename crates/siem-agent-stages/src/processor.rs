// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processor stage: turns raw lines into security events.
//!
//! ```text
//!   RawEvent ──► processing rules ──► classify ──► SecurityEvent
//!                (exclude/include/     (category,
//!                 mask)                 severity, source IP)
//! ```
//!
//! The processor keeps consuming until its input closes, which happens once the collector
//! has drained. `stop` waits a short grace period for that, then drains whatever is still
//! queued and exits.

use async_trait::async_trait;
use regex::Regex;
use siem_agent_core::pipeline::{self, Emitter, InputEndpoint, OutputEndpoint};
use siem_agent_core::{Consumer, Producer, RunContext, Stage, StageError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::processing_rule::{Kind, ProcessingRule};
use crate::config::{ConfigError, ProcessorConfig};
use crate::proc::get_hostname;
use crate::record::{Category, EventSource, RawEvent, SecurityEvent, Severity};
use crate::tasks::{finish_consumer, DRAIN_GRACE, STAGE_STOP_TIMEOUT};

const IPV4_PATTERN: &str =
    r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\b";
const SYSLOG_PRI_PATTERN: &str = r"^<([0-9]{1,3})>";

const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Authentication,
        &[
            "password",
            "login",
            "logon",
            "authentication",
            "sshd",
            "sudo",
            "su:",
            "pam_",
            "invalid user",
            "session opened",
        ],
    ),
    (
        Category::FileAccess,
        &["file", "permission denied", "chmod", "chown", "open(", "unlink"],
    ),
    (
        Category::NetworkActivity,
        &[
            "connection",
            "firewall",
            "iptables",
            "ufw",
            "port ",
            "dns",
            "tcp",
            "udp",
            "src=",
        ],
    ),
    (
        Category::SystemEvent,
        &["kernel", "systemd", "cron", "service", "reboot", "shutdown"],
    ),
];

const SEVERITY_KEYWORDS: &[(Severity, &[&str])] = &[
    (
        Severity::Critical,
        &[
            "critical",
            "fatal",
            "panic",
            "emergency",
            "segfault",
            "attack",
            "breach",
        ],
    ),
    (
        Severity::Error,
        &["error", "fail", "denied", "refused", "invalid"],
    ),
    (Severity::Warning, &["warn", "timeout", "timed out", "retry"]),
];

/// A processing rule with its pattern compiled.
#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub kind: Kind,
    pub regex: Regex,
    pub placeholder: String,
}

/// Compiles the configured rules. An invalid pattern is a configuration error.
pub fn compile_rules(rules: Option<&[ProcessingRule]>) -> Result<Vec<Rule>, ConfigError> {
    rules
        .unwrap_or_default()
        .iter()
        .map(|rule| {
            let regex = Regex::new(&rule.pattern).map_err(|e| ConfigError::Invalid {
                section: "processor",
                reason: format!("rule '{}': {e}", rule.name),
            })?;
            Ok(Rule {
                name: rule.name.clone(),
                kind: rule.kind,
                regex,
                placeholder: rule.replace_placeholder.clone().unwrap_or_default(),
            })
        })
        .collect()
}

/// Applies `rules` in order. Returns `false` when the line must be dropped.
pub fn apply_rules(rules: &[Rule], message: &mut String) -> bool {
    for rule in rules {
        match rule.kind {
            Kind::ExcludeAtMatch => {
                if rule.regex.is_match(message) {
                    trace!(rule = %rule.name, "Line excluded");
                    return false;
                }
            }
            Kind::IncludeAtMatch => {
                if !rule.regex.is_match(message) {
                    trace!(rule = %rule.name, "Line not included");
                    return false;
                }
            }
            Kind::MaskSequences => {
                if rule.regex.is_match(message) {
                    *message = rule
                        .regex
                        .replace_all(message, rule.placeholder.as_str())
                        .into_owned();
                }
            }
        }
    }
    true
}

/// Stateless transformation from [`RawEvent`] to [`SecurityEvent`].
#[derive(Clone, Debug)]
pub struct Normalizer {
    rules: Vec<Rule>,
    host: String,
    ipv4: Regex,
    syslog_pri: Regex,
}

impl Normalizer {
    pub fn new(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let pattern_error = |e: regex::Error| ConfigError::Invalid {
            section: "processor",
            reason: e.to_string(),
        };
        Ok(Self {
            rules: compile_rules(config.processing_rules.as_deref())?,
            host: config.hostname.clone().unwrap_or_else(get_hostname),
            ipv4: Regex::new(IPV4_PATTERN).map_err(pattern_error)?,
            syslog_pri: Regex::new(SYSLOG_PRI_PATTERN).map_err(pattern_error)?,
        })
    }

    /// `None` when a processing rule dropped the line or nothing is left of it.
    #[must_use]
    pub fn normalize(&self, raw: RawEvent) -> Option<SecurityEvent> {
        let mut message = raw.line;
        if !apply_rules(&self.rules, &mut message) {
            return None;
        }
        if message.trim().is_empty() {
            return None;
        }

        let lowered = message.to_lowercase();
        let severity = match (&raw.source, self.syslog_severity(&message)) {
            (EventSource::Syslog(_), Some(severity)) => severity,
            _ => classify_severity(&lowered),
        };
        let source_ip = self
            .ipv4
            .find(&message)
            .map(|m| m.as_str().to_string());

        Some(SecurityEvent {
            id: uuid::Uuid::new_v4(),
            timestamp: raw.received_at,
            category: classify_category(&lowered),
            severity,
            message,
            source: raw.source,
            source_ip,
            host: self.host.clone(),
            agent_id: None,
        })
    }

    /// Severity from a leading `<PRI>` syslog header.
    fn syslog_severity(&self, message: &str) -> Option<Severity> {
        let pri: u16 = self.syslog_pri.captures(message)?.get(1)?.as_str().parse().ok()?;
        Some(match pri & 0x7 {
            0..=2 => Severity::Critical,
            3 => Severity::Error,
            4 => Severity::Warning,
            _ => Severity::Info,
        })
    }
}

fn classify_category(lowered: &str) -> Category {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map_or(Category::ApplicationLog, |(category, _)| *category)
}

fn classify_severity(lowered: &str) -> Severity {
    SEVERITY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map_or(Severity::Info, |(severity, _)| *severity)
}

pub struct Processor {
    normalizer: Normalizer,
    input: Option<InputEndpoint<RawEvent>>,
    rx: Option<mpsc::Receiver<RawEvent>>,
    output: Option<OutputEndpoint<SecurityEvent>>,
    emitter: Option<Emitter<SecurityEvent>>,

    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Processor {
    pub fn new(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let normalizer = Normalizer::new(config)?;
        let (input, rx) = pipeline::input(config.channel_capacity);
        let (output, emitter) = pipeline::output();
        Ok(Self {
            normalizer,
            input: Some(input),
            rx: Some(rx),
            output: Some(output),
            emitter: Some(emitter),
            stop: CancellationToken::new(),
            task: None,
        })
    }
}

#[async_trait]
impl Stage for Processor {
    async fn start(&mut self, _ctx: RunContext) -> Result<(), StageError> {
        let (Some(rx), Some(emitter)) = (self.rx.take(), self.emitter.take()) else {
            return Err("processor was already started".into());
        };
        self.task = Some(tokio::spawn(run(
            self.normalizer.clone(),
            rx,
            emitter,
            self.stop.clone(),
        )));
        info!(rules = self.normalizer.rules.len(), host = %self.normalizer.host, "Processor started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), StageError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if !finish_consumer("processor", task, &self.stop, DRAIN_GRACE, STAGE_STOP_TIMEOUT).await {
            return Err("processor did not drain in time".into());
        }
        debug!("Processor stopped");
        Ok(())
    }
}

impl Consumer for Processor {
    type Input = RawEvent;

    fn input_endpoint(&mut self) -> Option<InputEndpoint<RawEvent>> {
        self.input.take()
    }
}

impl Producer for Processor {
    type Output = SecurityEvent;

    fn output_endpoint(&mut self) -> Option<OutputEndpoint<SecurityEvent>> {
        self.output.take()
    }
}

async fn run(
    normalizer: Normalizer,
    mut rx: mpsc::Receiver<RawEvent>,
    mut emitter: Emitter<SecurityEvent>,
    stop: CancellationToken,
) {
    let mut processed = 0u64;
    let mut dropped = 0u64;

    loop {
        let raw = tokio::select! {
            biased;
            raw = rx.recv() => raw,
            () = stop.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(raw) = raw else {
            break;
        };

        match normalizer.normalize(raw) {
            Some(event) => {
                if emitter.emit(event).await.is_err() {
                    debug!("Processor output detached");
                    break;
                }
                processed += 1;
            }
            None => dropped += 1,
        }
    }

    debug!(processed, dropped, "Processor drained");
}
