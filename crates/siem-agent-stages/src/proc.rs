// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host and self-process readers backed by `/proc`.
//!
//! Every reader degrades to `None` when a file is missing or malformed, which is the
//! normal case on non-Linux hosts and in locked-down containers.

use std::env;
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

const PROC_SELF_PATH: &str = "/proc/self";
const PROC_HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// Resource usage of the agent process itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfStats {
    pub rss_bytes: Option<u64>,
    /// User plus system CPU time.
    pub cpu_time_ms: Option<u64>,
    pub threads: Option<u64>,
    pub open_fds: Option<u64>,
}

#[must_use]
pub fn read_self_stats() -> SelfStats {
    read_self_stats_from(Path::new(PROC_SELF_PATH))
}

/// Reads `status`, `stat` and `fd/` below `proc_dir`.
pub fn read_self_stats_from(proc_dir: &Path) -> SelfStats {
    let (rss_bytes, threads) = match fs::read_to_string(proc_dir.join("status")) {
        Ok(status) => parse_status(&status),
        Err(e) => {
            debug!("Could not read {}/status: {e}", proc_dir.display());
            (None, None)
        }
    };

    let cpu_time_ms = fs::read_to_string(proc_dir.join("stat"))
        .ok()
        .and_then(|stat| parse_cpu_ticks(&stat))
        .and_then(|ticks| {
            let clk_tck = get_clk_tck().ok()?;
            Some(ticks * 1000 / clk_tck)
        });
    if cpu_time_ms.is_none() {
        debug!("Could not read CPU time from {}/stat", proc_dir.display());
    }

    let open_fds = fs::read_dir(proc_dir.join("fd"))
        .ok()
        .map(|entries| entries.filter_map(Result::ok).count() as u64);

    SelfStats {
        rss_bytes,
        cpu_time_ms,
        threads,
        open_fds,
    }
}

/// `VmRSS` (in bytes) and `Threads` from `/proc/<pid>/status`.
fn parse_status(status: &str) -> (Option<u64>, Option<u64>) {
    let mut rss = None;
    let mut threads = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            rss = value
                .split_whitespace()
                .next()
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| kb * 1024);
        } else if let Some(value) = line.strip_prefix("Threads:") {
            threads = value.trim().parse::<u64>().ok();
        }
    }
    (rss, threads)
}

/// `utime + stime` in clock ticks from `/proc/<pid>/stat`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses, fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime = fields.next()?.parse::<u64>().ok()?;
    let stime = fields.next()?.parse::<u64>().ok()?;
    Some(utime + stime)
}

#[allow(clippy::cast_sign_loss)]
#[cfg(unix)]
fn get_clk_tck() -> Result<u64, io::Error> {
    use nix::unistd::{sysconf, SysconfVar};

    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(clk_tck)) if clk_tck > 0 => Ok(clk_tck as u64),
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Could not find system clock ticks per second",
        )),
    }
}

#[cfg(not(unix))]
fn get_clk_tck() -> Result<u64, io::Error> {
    Ok(1)
}

/// Host name stamped on events.
///
/// Checks `HOSTNAME`, then the kernel, then `gethostname(2)`. Falls back to `"unknown"`.
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    if let Ok(hostname) = fs::read_to_string(PROC_HOSTNAME_PATH) {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    #[cfg(unix)]
    if let Ok(hostname) = nix::unistd::gethostname() {
        if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
            return hostname.to_string();
        }
    }

    debug!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
