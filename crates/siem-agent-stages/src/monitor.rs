// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitor stage: watches the agent process itself and reports liveness.
//!
//! Not part of the data pipeline. Every interval it samples `/proc/self`, logs the figures,
//! warns past the configured RSS ceiling and, when a heartbeat URL is configured, POSTs a
//! heartbeat for this agent. Heartbeat failures are logged and otherwise ignored.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use siem_agent_core::{AgentIdentity, RunContext, Stage, StageError};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, MonitorConfig};
use crate::http::get_client;
use crate::proc::{get_hostname, read_self_stats, SelfStats};
use crate::tasks::{join_within, STAGE_STOP_TIMEOUT};

#[derive(Debug, Serialize)]
struct Heartbeat<'a> {
    agent_id: &'a str,
    hostname: &'a str,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    uptime_secs: u64,
    rss_bytes: Option<u64>,
    cpu_time_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct Reporter {
    client: reqwest::Client,
    heartbeat_url: Option<String>,
    max_rss_bytes: Option<u64>,
    agent_id: String,
    hostname: String,
}

impl Reporter {
    fn observe(&self, stats: &SelfStats) {
        info!(
            rss_bytes = stats.rss_bytes,
            cpu_time_ms = stats.cpu_time_ms,
            threads = stats.threads,
            open_fds = stats.open_fds,
            "Agent resource usage"
        );
        if let (Some(rss), Some(limit)) = (stats.rss_bytes, self.max_rss_bytes) {
            if rss > limit {
                warn!(rss_bytes = rss, limit_bytes = limit, "Agent memory above configured ceiling");
            }
        }
    }

    async fn heartbeat(&self, stats: &SelfStats, uptime: Duration) {
        let Some(url) = &self.heartbeat_url else {
            return;
        };
        let body = Heartbeat {
            agent_id: &self.agent_id,
            hostname: &self.hostname,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: chrono::Utc::now(),
            uptime_secs: uptime.as_secs(),
            rss_bytes: stats.rss_bytes,
            cpu_time_ms: stats.cpu_time_ms,
        };

        match self.client.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => debug!("Heartbeat sent"),
            Ok(response) => warn!(status = %response.status(), "Heartbeat rejected"),
            Err(e) => warn!("Heartbeat failed: {e}"),
        }
    }
}

pub struct Monitor {
    reporter: Reporter,
    interval: Duration,
    cancel: Option<CancellationToken>,
    tasks: JoinSet<()>,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, identity: &AgentIdentity) -> Result<Self, ConfigError> {
        config.validate()?;
        let heartbeat_url = config.heartbeat_url.as_ref().map(|base| {
            format!(
                "{}/agents/{}/heartbeat",
                base.trim_end_matches('/'),
                identity.as_str()
            )
        });
        Ok(Self {
            reporter: Reporter {
                client: get_client(Duration::from_secs(config.timeout_secs)),
                heartbeat_url,
                max_rss_bytes: config.max_rss_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
                agent_id: identity.as_str().to_string(),
                hostname: get_hostname(),
            },
            interval: Duration::from_secs(config.interval_secs),
            cancel: None,
            tasks: JoinSet::new(),
        })
    }

    #[must_use]
    pub fn heartbeat_url(&self) -> Option<&str> {
        self.reporter.heartbeat_url.as_deref()
    }
}

#[async_trait]
impl Stage for Monitor {
    async fn start(&mut self, ctx: RunContext) -> Result<(), StageError> {
        if self.cancel.is_some() {
            return Err("monitor was already started".into());
        }
        let cancel = ctx.child_token();
        self.tasks
            .spawn(watch(self.reporter.clone(), self.interval, cancel.clone()));
        self.cancel = Some(cancel);
        info!(
            interval_secs = self.interval.as_secs(),
            heartbeat = self.reporter.heartbeat_url.is_some(),
            "Monitor started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), StageError> {
        let Some(cancel) = self.cancel.take() else {
            return Ok(());
        };
        cancel.cancel();
        if !join_within("monitor", &mut self.tasks, STAGE_STOP_TIMEOUT).await {
            return Err("monitor did not stop in time".into());
        }
        debug!("Monitor stopped");
        Ok(())
    }
}

async fn watch(reporter: Reporter, period: Duration, cancel: CancellationToken) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = read_self_stats();
                reporter.observe(&stats);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = reporter.heartbeat(&stats, started.elapsed()) => {}
                }
            }
        }
    }
}
