// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Version and build metadata of the running binary.
///
/// Injected at process entry so tests can substitute their own values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub date: &'static str,
}

impl BuildInfo {
    /// Metadata baked in at compile time.
    ///
    /// `SIEM_AGENT_COMMIT` and `SIEM_AGENT_BUILD_DATE` are read from the build environment
    /// and default to `unknown`.
    #[must_use]
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            commit: match option_env!("SIEM_AGENT_COMMIT") {
                Some(commit) => commit,
                None => "unknown",
            },
            date: match option_env!("SIEM_AGENT_BUILD_DATE") {
                Some(date) => date,
                None => "unknown",
            },
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (commit: {}, date: {})",
            self.version, self.commit, self.date
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let info = BuildInfo {
            version: "1.0.0",
            commit: "abc123",
            date: "2025-01-01",
        };
        assert_eq!(info.to_string(), "1.0.0 (commit: abc123, date: 2025-01-01)");
    }

    #[test]
    fn test_current_uses_package_version() {
        assert_eq!(BuildInfo::current().version, env!("CARGO_PKG_VERSION"));
    }
}
