// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format of the agent.
//!
//! ```text
//! SIEM_AGENT | INFO | agent{agent_id=3f2a… version="0.1.0"}: Stage started stage=collector
//! ```
//!
//! In daemon mode each line is prefixed with an RFC 3339 UTC timestamp and ANSI colors are
//! disabled.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const PREFIX: &str = "SIEM_AGENT";

#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter {
    timestamps: bool,
}

impl Formatter {
    #[must_use]
    pub fn new(timestamps: bool) -> Self {
        Self { timestamps }
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if self.timestamps {
            write!(
                writer,
                "{} ",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
            )?;
        }
        write!(writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter for `level`, with noisy HTTP internals silenced.
pub fn env_filter(level: &str) -> Result<EnvFilter, String> {
    EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{}", level.to_lowercase()))
        .map_err(|e| format!("invalid log level '{level}': {e}"))
}

/// Installs the global subscriber.
pub fn init(level: &str, daemon: bool) -> Result<(), String> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level)?)
        .with_ansi(!daemon)
        .event_format(Formatter::new(daemon))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to install log subscriber: {e}"))
}
