// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processing rules for filtering and masking collected lines.
//!
//! Rules run in order against the raw line before it is classified:
//!
//! - **exclude_at_match**: drop the line when the pattern matches (cron noise, health checks)
//! - **include_at_match**: drop the line unless the pattern matches
//! - **mask_sequences**: replace every match with `replace_placeholder` (passwords, tokens)
//!
//! ```yaml
//! processor:
//!   processing_rules:
//!     - type: exclude_at_match
//!       name: drop_cron
//!       pattern: "CRON\\["
//!     - type: mask_sequences
//!       name: mask_passwords
//!       pattern: "password=\\S+"
//!       replace_placeholder: "password=[REDACTED]"
//! ```
//!
//! From the environment the list is given as a JSON string:
//! `SIEM_AGENT_PROCESSOR__PROCESSING_RULES='[{"type":"exclude_at_match","name":"cron","pattern":"CRON"}]'`

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    ExcludeAtMatch,
    IncludeAtMatch,
    MaskSequences,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProcessingRule {
    #[serde(rename = "type")]
    pub kind: Kind,
    /// Rule name, used in log lines.
    pub name: String,
    pub pattern: String,
    /// Only used by `mask_sequences`.
    pub replace_placeholder: Option<String>,
}

/// Accepts the rules either as a list (YAML) or as a JSON string (environment).
///
/// Malformed entries are logged and skipped so one typo does not disable every rule. A
/// pattern that is not a valid regex is still rejected later, when the processor compiles it.
pub fn deserialize_processing_rules<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<ProcessingRule>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: JsonValue = Deserialize::deserialize(deserializer)?;

    match value {
        JsonValue::String(s) => match serde_json::from_str::<Vec<JsonValue>>(&s) {
            Ok(values) => Ok(collect_rules(values)),
            Err(e) => {
                tracing::error!("Failed to parse processing rules: {}, ignoring", e);
                Ok(None)
            }
        },
        JsonValue::Array(values) => Ok(collect_rules(values)),
        JsonValue::Null => Ok(None),
        other => {
            tracing::error!(
                "Failed to parse processing rules, expected a list, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

fn collect_rules(values: Vec<JsonValue>) -> Option<Vec<ProcessingRule>> {
    let rules: Vec<ProcessingRule> = values
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(rule) => Some(rule),
            Err(e) => {
                tracing::error!("Failed to parse processing rule: {}, ignoring", e);
                None
            }
        })
        .collect();

    if rules.is_empty() {
        None
    } else {
        Some(rules)
    }
}
