// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle orchestrator.
//!
//! ```text
//!   Constructing ──► Starting ──► Running ──► ShuttingDown ──► Stopped
//!        │              │                                         ▲
//!        └──────────────┴──────────── (failure) ──────────────────┘
//! ```
//!
//! 1. **Constructing**: collector, processor, sender, monitor are built from configuration
//!    and their pipeline endpoints are taken. Nothing is started, so a failure here needs no
//!    teardown.
//! 2. **Starting**: stages are started in the same order with a shared [`RunContext`]. If a
//!    start fails, the stages already started are stopped in reverse order before the error
//!    is returned.
//! 3. **Running**: collector → processor → sender are wired, then the orchestrator waits for
//!    either a termination signal or cancellation of the run context.
//! 4. **ShuttingDown**: the run context is cancelled and every started stage is stopped in
//!    reverse order within the shutdown budget (30s by default). A failed stop never skips
//!    the remaining ones; a stop still running at the deadline is left behind.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::build_info::BuildInfo;
use crate::context::{AgentHandle, RunContext, StageFault};
use crate::error::{AgentError, StageError};
use crate::identity::AgentIdentity;
use crate::pipeline::connect;
use crate::signals::{ShutdownSignal, SignalGateway};
use crate::stage::{Consumer, PipelineFactory, Producer, Stage, StageKind};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Budget for stopping all stages, measured from the moment shutdown begins. Also bounds
    /// the unwind after a failed start.
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructing,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// What woke the orchestrator out of `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal was delivered.
    Signal(ShutdownSignal),
    /// The run was cancelled through an [`AgentHandle`].
    Cancelled,
    /// A stage reported a fatal fault.
    StageFault(StageFault),
}

/// Outcome of a run that reached `Running`.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Stop calls that returned an error, in stop order.
    pub stop_errors: Vec<(StageKind, String)>,
    /// Stages whose stop call had not returned when the shutdown budget ran out.
    pub unconfirmed: Vec<StageKind>,
    /// Time spent in `ShuttingDown`.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Every stage stopped in time without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stop_errors.is_empty() && self.unconfirmed.is_empty()
    }

    /// The run ended the way an operator expects: shutdown was requested rather than forced
    /// by a stage fault, and at least one stage confirmed it stopped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        let requested = !matches!(self.reason, ShutdownReason::StageFault(_));
        let any_confirmed = self.unconfirmed.len() < StageKind::START_ORDER.len();
        requested && any_confirmed
    }
}

#[derive(Default)]
struct StopProgress {
    confirmed: Vec<StageKind>,
    errors: Vec<(StageKind, String)>,
}

struct StopOutcome {
    errors: Vec<(StageKind, String)>,
    unconfirmed: Vec<StageKind>,
}

type StartedStages = Vec<(StageKind, Box<dyn Stage>)>;

/// Drives the four stages through their lifecycle. See the module docs for the sequence.
pub struct Orchestrator<F: PipelineFactory> {
    factory: F,
    identity: AgentIdentity,
    build: BuildInfo,
    options: OrchestratorOptions,

    /// Run context shared by all stages. Cancelled on shutdown, by a stage fault, or through
    /// an [`AgentHandle`].
    run_token: CancellationToken,
    faults_tx: mpsc::UnboundedSender<StageFault>,
    faults_rx: mpsc::UnboundedReceiver<StageFault>,
    state_tx: watch::Sender<LifecycleState>,
}

impl<F: PipelineFactory> Orchestrator<F> {
    #[must_use]
    pub fn new(
        factory: F,
        identity: AgentIdentity,
        build: BuildInfo,
        options: OrchestratorOptions,
    ) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LifecycleState::Constructing);
        Self {
            factory,
            identity,
            build,
            options,
            run_token: CancellationToken::new(),
            faults_tx,
            faults_rx,
            state_tx,
        }
    }

    /// Handle for requesting shutdown from outside.
    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle::new(self.run_token.clone())
    }

    /// Receiver for lifecycle state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Runs the agent until shutdown completes.
    ///
    /// Returns `Err` if the agent never reached `Running`. Otherwise returns the shutdown
    /// report; stop failures and an exceeded deadline are recorded there, not raised.
    pub async fn run(self, signals: SignalGateway) -> Result<ShutdownReport, AgentError> {
        let span = info_span!(
            "agent",
            agent_id = %self.identity,
            version = self.build.version
        );
        self.run_stages(signals).instrument(span).await
    }

    async fn run_stages(
        mut self,
        mut signals: SignalGateway,
    ) -> Result<ShutdownReport, AgentError> {
        info!(
            commit = self.build.commit,
            build_date = self.build.date,
            "Starting SIEM agent"
        );

        self.transition(LifecycleState::Constructing);
        let (stages, wiring) = match self.construct() {
            Ok(constructed) => constructed,
            Err(e) => {
                error!("Agent startup failed: {e}");
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
        };

        self.transition(LifecycleState::Starting);
        let (started, wiring) = self.start(stages, wiring).await?;

        wiring.connect();
        self.transition(LifecycleState::Running);
        info!("Agent started successfully");

        let reason = tokio::select! {
            signal = signals.wait() => {
                info!(%signal, "Shutdown signal received");
                ShutdownReason::Signal(signal)
            }
            () = self.run_token.cancelled() => match self.faults_rx.try_recv() {
                Ok(fault) => {
                    warn!(stage = %fault.stage, "Shutdown triggered by stage fault: {}", fault.reason);
                    ShutdownReason::StageFault(fault)
                }
                Err(_) => {
                    info!("Run context cancelled");
                    ShutdownReason::Cancelled
                }
            },
        };

        self.transition(LifecycleState::ShuttingDown);
        info!("Shutting down agent");
        let clock = Instant::now();
        self.run_token.cancel();

        let outcome = stop_in_reverse(started, self.options.shutdown_timeout).await;
        let report = ShutdownReport {
            reason,
            stop_errors: outcome.errors,
            unconfirmed: outcome.unconfirmed,
            elapsed: clock.elapsed(),
        };

        self.transition(LifecycleState::Stopped);
        if report.is_clean() {
            info!(
                duration_secs = report.elapsed.as_secs_f64(),
                "Agent shutdown complete"
            );
        } else {
            warn!(
                duration_secs = report.elapsed.as_secs_f64(),
                stop_errors = report.stop_errors.len(),
                unconfirmed = ?report.unconfirmed,
                "Agent shutdown complete with failures"
            );
        }
        Ok(report)
    }

    /// Builds the stages in start order and takes their pipeline endpoints.
    fn construct(&self) -> Result<(StartedStages, Wiring<F>), AgentError> {
        let mut collector = built(StageKind::Collector, self.factory.collector())?;
        let mut processor = built(StageKind::Processor, self.factory.processor())?;
        let mut sender = built(StageKind::Sender, self.factory.sender(&self.identity))?;
        let monitor = built(StageKind::Monitor, self.factory.monitor(&self.identity))?;

        let wiring = Wiring::<F> {
            collector_out: collector.output_endpoint().ok_or(AgentError::Wiring {
                stage: StageKind::Collector,
                endpoint: "output",
            })?,
            processor_in: processor.input_endpoint().ok_or(AgentError::Wiring {
                stage: StageKind::Processor,
                endpoint: "input",
            })?,
            processor_out: processor.output_endpoint().ok_or(AgentError::Wiring {
                stage: StageKind::Processor,
                endpoint: "output",
            })?,
            sender_in: sender.input_endpoint().ok_or(AgentError::Wiring {
                stage: StageKind::Sender,
                endpoint: "input",
            })?,
        };

        let stages: StartedStages = vec![
            (StageKind::Collector, Box::new(collector)),
            (StageKind::Processor, Box::new(processor)),
            (StageKind::Sender, Box::new(sender)),
            (StageKind::Monitor, Box::new(monitor)),
        ];
        Ok((stages, wiring))
    }

    /// Starts stages in order. On the first failure, drops the unconnected endpoints so the
    /// started consumers see their input close, then unwinds the stages already started.
    async fn start(
        &self,
        stages: StartedStages,
        wiring: Wiring<F>,
    ) -> Result<(StartedStages, Wiring<F>), AgentError> {
        let mut started: StartedStages = Vec::with_capacity(stages.len());

        for (kind, mut stage) in stages {
            debug!(stage = %kind, "Starting stage");
            let ctx = RunContext::new(kind, self.run_token.clone(), self.faults_tx.clone());
            match stage.start(ctx).await {
                Ok(()) => {
                    info!(stage = %kind, "Stage started");
                    started.push((kind, stage));
                }
                Err(source) => {
                    error!(stage = %kind, "Stage failed to start: {source}");
                    self.run_token.cancel();
                    drop(wiring);
                    if !started.is_empty() {
                        info!(
                            count = started.len(),
                            "Stopping already started stages after failed startup"
                        );
                        stop_in_reverse(started, self.options.shutdown_timeout).await;
                    }
                    self.transition(LifecycleState::Stopped);
                    return Err(AgentError::Start {
                        stage: kind,
                        source,
                    });
                }
            }
        }

        info!("All stages started");
        Ok((started, wiring))
    }

    fn transition(&self, state: LifecycleState) {
        debug!(?state, "Lifecycle transition");
        self.state_tx.send_replace(state);
    }
}

/// Endpoints taken during construction, connected once all stages started.
struct Wiring<F: PipelineFactory> {
    collector_out: crate::pipeline::OutputEndpoint<<F::Collector as Producer>::Output>,
    processor_in: crate::pipeline::InputEndpoint<<F::Processor as Consumer>::Input>,
    processor_out: crate::pipeline::OutputEndpoint<<F::Processor as Producer>::Output>,
    sender_in: crate::pipeline::InputEndpoint<<F::Sender as Consumer>::Input>,
}

impl<F: PipelineFactory> Wiring<F> {
    fn connect(self) {
        connect(self.collector_out, self.processor_in);
        debug!("Wired collector to processor");
        connect(self.processor_out, self.sender_in);
        debug!("Wired processor to sender");
    }
}

fn built<S>(stage: StageKind, result: Result<S, StageError>) -> Result<S, AgentError> {
    match result {
        Ok(s) => {
            info!(%stage, "Stage constructed");
            Ok(s)
        }
        Err(source) => Err(AgentError::Construction { stage, source }),
    }
}

/// Stops `stages` last-started first.
///
/// Every stop call is made, whatever the previous ones returned, and each runs in its own
/// task so a panicking stage is recorded like an error. The sequence runs in the background:
/// once `budget` elapses the caller gets an outcome listing the stages that have not
/// confirmed yet, while the remaining stop calls keep going.
async fn stop_in_reverse(stages: StartedStages, budget: Duration) -> StopOutcome {
    let order: Vec<StageKind> = stages.iter().rev().map(|(kind, _)| *kind).collect();
    let progress = Arc::new(Mutex::new(StopProgress::default()));

    let sequence_progress = Arc::clone(&progress);
    let sequence = tokio::spawn(
        async move {
            for (kind, mut stage) in stages.into_iter().rev() {
                debug!(stage = %kind, "Stopping stage");
                let stop = tokio::spawn(
                    async move { stage.stop().await.map_err(|e| e.to_string()) }
                        .instrument(Span::current()),
                );
                let result = match stop.await {
                    Ok(result) => result,
                    Err(join_error) => Err(format!("stop task failed: {join_error}")),
                };

                let mut progress = sequence_progress
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match result {
                    Ok(()) => info!(stage = %kind, "Stage stopped"),
                    Err(reason) => {
                        error!(stage = %kind, "Stage failed to stop cleanly: {reason}");
                        progress.errors.push((kind, reason));
                    }
                }
                progress.confirmed.push(kind);
            }
        }
        .instrument(Span::current()),
    );

    if tokio::time::timeout(budget, sequence).await.is_err() {
        warn!(
            budget_secs = budget.as_secs_f64(),
            "Shutdown deadline exceeded before all stages confirmed they stopped"
        );
    }

    let progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
    StopOutcome {
        errors: progress.errors.clone(),
        unconfirmed: order
            .into_iter()
            .filter(|kind| !progress.confirmed.contains(kind))
            .collect(),
    }
}
