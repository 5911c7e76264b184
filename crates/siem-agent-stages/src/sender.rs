// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender stage: batches security events and ships them to the SIEM backend.
//!
//! Batches are serialized as a JSON array and POSTed to `<endpoint><events_path>`.
//! Network errors and 5xx responses are retried up to `retry_count` attempts; any other
//! non-success status is permanent and the batch is dropped with an error log.
//!
//! A batch is flushed when it reaches `batch_size` or when the flush interval ticks. On
//! stop the input is drained and whatever is left is flushed once more.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use siem_agent_core::pipeline::{self, InputEndpoint};
use siem_agent_core::{AgentIdentity, Consumer, RunContext, Stage, StageError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zstd::stream::write::Encoder;

use crate::config::{ConfigError, SenderConfig};
use crate::http::get_client;
use crate::record::SecurityEvent;
use crate::tasks::{finish_consumer, DRAIN_GRACE, STAGE_STOP_TIMEOUT};

pub const AGENT_ID_HEADER: &str = "X-Agent-ID";

/// Base delay between delivery attempts, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("backend at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to compress batch: {0}")]
    Compress(#[source] std::io::Error),
    #[error("backend rejected batch with status {0}")]
    Rejected(StatusCode),
    #[error("batch not delivered after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
    #[error("sender was already started")]
    AlreadyStarted,
    #[error("sender did not finish draining in time")]
    StopTimeout,
}

/// HTTP side of the sender: request construction, compression and retries.
#[derive(Debug, Clone)]
pub struct Shipper {
    client: reqwest::Client,
    events_url: String,
    health_url: String,
    headers: HeaderMap,
    agent_id: String,
    retry_count: u32,
    compression_level: Option<i32>,
}

impl Shipper {
    pub fn new(config: &SenderConfig, identity: &AgentIdentity) -> Result<Self, ConfigError> {
        config.validate()?;

        let header_error = |name: &str| ConfigError::Invalid {
            section: "sender",
            reason: format!("{name} contains characters not allowed in a header"),
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            AGENT_ID_HEADER,
            HeaderValue::from_str(identity.as_str()).map_err(|_| header_error("agent id"))?,
        );
        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .map_err(|_| header_error("api_key"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let compression_level = config.use_compression.then_some(config.compression_level);

        Ok(Self {
            client: get_client(Duration::from_secs(config.timeout_secs)),
            events_url: config.url(&config.events_path),
            health_url: config.url(&config.health_path),
            headers,
            agent_id: identity.as_str().to_string(),
            retry_count: config.retry_count,
            compression_level,
        })
    }

    /// `GET <endpoint><health_path>` must answer with a success status.
    pub async fn check_health(&self) -> Result<(), SenderError> {
        let unreachable = |reason: String| SenderError::Unreachable {
            url: self.health_url.clone(),
            reason,
        };
        let response = self
            .client
            .get(&self.health_url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("health check returned {status}")));
        }
        Ok(())
    }

    /// Stamps the agent id on every event and delivers them as one batch.
    pub async fn ship(&self, events: &mut [SecurityEvent]) -> Result<(), SenderError> {
        for event in events.iter_mut() {
            event.agent_id = Some(self.agent_id.clone());
        }
        let body = self.encode(&serde_json::to_vec(events)?)?;

        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        let request = self.client.post(&self.events_url).headers(headers).body(body);

        self.send(request).await
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, SenderError> {
        let Some(level) = self.compression_level else {
            return Ok(data.to_vec());
        };
        let mut encoder = Encoder::new(Vec::new(), level).map_err(SenderError::Compress)?;
        encoder.write_all(data).map_err(SenderError::Compress)?;
        encoder.finish().map_err(SenderError::Compress)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(), SenderError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let Some(attempt) = request.try_clone() else {
                return Err(SenderError::Exhausted {
                    attempts,
                    reason: "request body cannot be replayed".to_string(),
                });
            };

            let reason = match attempt.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if !status.is_server_error() {
                        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                            error!("Request was denied by the backend, verify the configured api_key");
                        }
                        return Err(SenderError::Rejected(status));
                    }
                    format!("backend returned {status}")
                }
                Err(e) => e.to_string(),
            };

            if attempts >= self.retry_count {
                return Err(SenderError::Exhausted { attempts, reason });
            }
            debug!(attempts, "Delivery attempt failed, retrying: {reason}");
            tokio::time::sleep(RETRY_BACKOFF * attempts).await;
        }
    }
}

pub struct Sender {
    shipper: Shipper,
    verify_on_start: bool,
    batch_size: usize,
    flush_interval: Duration,

    input: Option<InputEndpoint<SecurityEvent>>,
    rx: Option<mpsc::Receiver<SecurityEvent>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Sender {
    pub fn new(config: &SenderConfig, identity: &AgentIdentity) -> Result<Self, ConfigError> {
        let shipper = Shipper::new(config, identity)?;
        let (input, rx) = pipeline::input(config.channel_capacity);
        Ok(Self {
            shipper,
            verify_on_start: config.verify_on_start,
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            input: Some(input),
            rx: Some(rx),
            stop: CancellationToken::new(),
            task: None,
        })
    }
}

#[async_trait]
impl Stage for Sender {
    async fn start(&mut self, _ctx: RunContext) -> Result<(), StageError> {
        if self.rx.is_none() {
            return Err(SenderError::AlreadyStarted.into());
        }
        if self.verify_on_start {
            self.shipper.check_health().await?;
            debug!(url = %self.shipper.health_url, "Backend health check passed");
        }
        let Some(rx) = self.rx.take() else {
            return Err(SenderError::AlreadyStarted.into());
        };

        self.task = Some(tokio::spawn(run(
            self.shipper.clone(),
            rx,
            self.batch_size,
            self.flush_interval,
            self.stop.clone(),
        )));
        info!(
            url = %self.shipper.events_url,
            batch_size = self.batch_size,
            compression = self.shipper.compression_level.is_some(),
            "Sender started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), StageError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if !finish_consumer("sender", task, &self.stop, DRAIN_GRACE, STAGE_STOP_TIMEOUT).await {
            return Err(SenderError::StopTimeout.into());
        }
        debug!("Sender stopped");
        Ok(())
    }
}

impl Consumer for Sender {
    type Input = SecurityEvent;

    fn input_endpoint(&mut self) -> Option<InputEndpoint<SecurityEvent>> {
        self.input.take()
    }
}

async fn run(
    shipper: Shipper,
    mut rx: mpsc::Receiver<SecurityEvent>,
    batch_size: usize,
    flush_interval: Duration,
    stop: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut draining = false;

    loop {
        tokio::select! {
            biased;
            received = rx.recv() => {
                let Some(event) = received else {
                    break;
                };
                batch.push(event);
                if batch.len() >= batch_size {
                    flush(&shipper, &mut batch).await;
                }
            }
            () = stop.cancelled(), if !draining => {
                draining = true;
                rx.close();
            }
            _ = ticker.tick() => {
                flush(&shipper, &mut batch).await;
            }
        }
    }

    flush(&shipper, &mut batch).await;
    debug!("Sender drained");
}

async fn flush(shipper: &Shipper, batch: &mut Vec<SecurityEvent>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    match shipper.ship(batch).await {
        Ok(()) => debug!(count, "Batch delivered"),
        Err(SenderError::Rejected(status)) => {
            error!(count, %status, "Batch rejected by backend, dropping");
        }
        Err(e) => warn!(count, "Dropping batch: {e}"),
    }
    batch.clear();
}
