// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end lifecycle tests driven through instrumented stage doubles.
//!
//! Every double appends to a shared call log, so ordering of construction, start, wiring
//! (observed as record deliveries) and stop can be asserted directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use siem_agent_core::pipeline::{self, Emitter, InputEndpoint, OutputEndpoint};
use siem_agent_core::{
    AgentError, AgentIdentity, BuildInfo, Consumer, LifecycleState, Orchestrator,
    OrchestratorOptions, PipelineFactory, Producer, RunContext, ShutdownReason, ShutdownReport,
    ShutdownSignal, SignalGateway, SignalTrigger, Stage, StageError, StageKind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
}

#[derive(Clone, Default)]
struct Script {
    fail_construct: Option<StageKind>,
    fail_start: Option<StageKind>,
    fail_stop: Option<StageKind>,
    hang_stop: Option<StageKind>,
    fault_after_start: Option<StageKind>,
}

struct Double {
    kind: StageKind,
    log: CallLog,
    script: Script,
    output: Option<OutputEndpoint<u32>>,
    emitter: Option<Emitter<u32>>,
    input: Option<InputEndpoint<u32>>,
    rx: Option<mpsc::Receiver<u32>>,
    task: Option<JoinHandle<()>>,
}

impl Double {
    fn new(kind: StageKind, log: &CallLog, script: &Script) -> Result<Self, StageError> {
        record(log, format!("construct:{kind}"));
        if script.fail_construct == Some(kind) {
            return Err(format!("invalid {kind} section").into());
        }

        let (output, emitter) = if matches!(kind, StageKind::Collector | StageKind::Processor) {
            let (out, emitter) = pipeline::output();
            (Some(out), Some(emitter))
        } else {
            (None, None)
        };
        let (input, rx) = if matches!(kind, StageKind::Processor | StageKind::Sender) {
            let (inp, rx) = pipeline::input(8);
            (Some(inp), Some(rx))
        } else {
            (None, None)
        };

        Ok(Self {
            kind,
            log: Arc::clone(log),
            script: script.clone(),
            output,
            emitter,
            input,
            rx,
            task: None,
        })
    }
}

#[async_trait]
impl Stage for Double {
    async fn start(&mut self, ctx: RunContext) -> Result<(), StageError> {
        record(&self.log, format!("start:{}", self.kind));
        if self.script.fail_start == Some(self.kind) {
            return Err("backend unreachable".into());
        }
        if self.script.fault_after_start == Some(self.kind) {
            ctx.report_fatal("disk vanished");
        }

        let log = Arc::clone(&self.log);
        let kind = self.kind;
        let emitter = self.emitter.take();
        let rx = self.rx.take();
        self.task = Some(tokio::spawn(async move {
            match (kind, emitter, rx) {
                (StageKind::Collector, Some(mut emitter), _) => {
                    if emitter.emit(1).await.is_ok() {
                        record(&log, "emitted:collector");
                    }
                }
                (StageKind::Processor, Some(mut emitter), Some(mut rx)) => {
                    while let Some(value) = rx.recv().await {
                        record(&log, format!("received:processor:{value}"));
                        let _ = emitter.emit(value + 1).await;
                    }
                }
                (StageKind::Sender, _, Some(mut rx)) => {
                    while let Some(value) = rx.recv().await {
                        record(&log, format!("received:sender:{value}"));
                    }
                }
                _ => ctx.cancelled().await,
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), StageError> {
        record(&self.log, format!("stop:{}", self.kind));
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.script.hang_stop == Some(self.kind) {
            std::future::pending::<()>().await;
        }
        if self.script.fail_stop == Some(self.kind) {
            return Err("socket still bound".into());
        }
        Ok(())
    }
}

impl Producer for Double {
    type Output = u32;

    fn output_endpoint(&mut self) -> Option<OutputEndpoint<u32>> {
        self.output.take()
    }
}

impl Consumer for Double {
    type Input = u32;

    fn input_endpoint(&mut self) -> Option<InputEndpoint<u32>> {
        self.input.take()
    }
}

struct DoubleFactory {
    log: CallLog,
    script: Script,
}

impl PipelineFactory for DoubleFactory {
    type Collector = Double;
    type Processor = Double;
    type Sender = Double;
    type Monitor = Double;

    fn collector(&self) -> Result<Double, StageError> {
        Double::new(StageKind::Collector, &self.log, &self.script)
    }

    fn processor(&self) -> Result<Double, StageError> {
        Double::new(StageKind::Processor, &self.log, &self.script)
    }

    fn sender(&self, identity: &AgentIdentity) -> Result<Double, StageError> {
        record(&self.log, format!("identity:{identity}"));
        Double::new(StageKind::Sender, &self.log, &self.script)
    }

    fn monitor(&self, _identity: &AgentIdentity) -> Result<Double, StageError> {
        Double::new(StageKind::Monitor, &self.log, &self.script)
    }
}

fn test_build() -> BuildInfo {
    BuildInfo {
        version: "0.0.0-test",
        commit: "abc1234",
        date: "2025-01-01",
    }
}

fn orchestrator(script: Script) -> (Orchestrator<DoubleFactory>, CallLog) {
    let log = CallLog::default();
    let factory = DoubleFactory {
        log: Arc::clone(&log),
        script,
    };
    let orchestrator = Orchestrator::new(
        factory,
        siem_agent_core::identity::resolve(Some("agent-42")),
        test_build(),
        OrchestratorOptions::default(),
    );
    (orchestrator, log)
}

/// Runs until `Running` and the test record made it through collector → processor → sender,
/// then raises `signal`.
async fn run_to_signal(
    orchestrator: Orchestrator<DoubleFactory>,
    log: &CallLog,
    signals: &[ShutdownSignal],
) -> ShutdownReport {
    let (trigger, gateway) = SignalGateway::channel();
    let mut state = orchestrator.state_receiver();
    let run = tokio::spawn(orchestrator.run(gateway));

    state
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    wait_for_entry(log, "received:sender:2").await;

    raise_all(&trigger, signals);
    run.await.unwrap().unwrap()
}

fn raise_all(trigger: &SignalTrigger, signals: &[ShutdownSignal]) {
    for signal in signals {
        trigger.raise(*signal);
    }
}

async fn wait_for_entry(log: &CallLog, entry: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !entries(log).iter().any(|e| e == entry) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{entry} never recorded: {:?}", entries(log)));
}

#[tokio::test]
async fn test_full_lifecycle_order() {
    let (orchestrator, log) = orchestrator(Script::default());

    let report = run_to_signal(orchestrator, &log, &[ShutdownSignal::Terminate]).await;
    let log = entries(&log);

    let lifecycle: Vec<&String> = log
        .iter()
        .filter(|e| e.starts_with("construct:") || e.starts_with("start:") || e.starts_with("stop:"))
        .collect();
    assert_eq!(
        lifecycle,
        [
            "construct:collector",
            "construct:processor",
            "construct:sender",
            "construct:monitor",
            "start:collector",
            "start:processor",
            "start:sender",
            "start:monitor",
            "stop:monitor",
            "stop:sender",
            "stop:processor",
            "stop:collector",
        ]
    );

    assert_eq!(report.reason, ShutdownReason::Signal(ShutdownSignal::Terminate));
    assert!(report.is_clean());
    assert!(report.is_success());
}

#[tokio::test]
async fn test_sender_receives_resolved_identity() {
    let (orchestrator, log) = orchestrator(Script::default());
    run_to_signal(orchestrator, &log, &[ShutdownSignal::Interrupt]).await;

    let log = entries(&log);
    assert!(log.contains(&"identity:agent-42".to_string()));
}

#[tokio::test]
async fn test_wiring_happens_once_after_all_starts() {
    let (orchestrator, log) = orchestrator(Script::default());
    run_to_signal(orchestrator, &log, &[ShutdownSignal::Interrupt]).await;

    let log = entries(&log);
    let last_start = position(&log, "start:monitor");
    assert!(position(&log, "emitted:collector") > last_start);
    assert!(position(&log, "received:processor:1") > last_start);
    assert!(position(&log, "received:sender:2") > last_start);

    assert_eq!(log.iter().filter(|e| *e == "received:processor:1").count(), 1);
    assert_eq!(log.iter().filter(|e| *e == "received:sender:2").count(), 1);
}

#[tokio::test]
async fn test_processor_start_failure_unwinds_collector() {
    let (orchestrator, log) = orchestrator(Script {
        fail_start: Some(StageKind::Processor),
        ..Script::default()
    });
    let mut state = orchestrator.state_receiver();
    let (_trigger, gateway) = SignalGateway::channel();

    let err = orchestrator.run(gateway).await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::Start {
            stage: StageKind::Processor,
            ..
        }
    ));
    let log = entries(&log);
    assert!(position(&log, "stop:collector") > position(&log, "start:processor"));
    assert!(!log.contains(&"start:sender".to_string()));
    assert!(!log.contains(&"start:monitor".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("received:")));
    assert_eq!(*state.borrow_and_update(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_unreachable_sender_stops_earlier_stages_in_reverse() {
    let (orchestrator, log) = orchestrator(Script {
        fail_start: Some(StageKind::Sender),
        ..Script::default()
    });
    let (_trigger, gateway) = SignalGateway::channel();

    let err = orchestrator.run(gateway).await.unwrap_err();

    assert_eq!(err.stage(), Some(StageKind::Sender));
    let log = entries(&log);
    let stops: Vec<&String> = log.iter().filter(|e| e.starts_with("stop:")).collect();
    assert_eq!(stops, ["stop:processor", "stop:collector"]);
    assert!(!log.contains(&"start:monitor".to_string()));
}

#[tokio::test]
async fn test_construction_failure_starts_nothing() {
    let (orchestrator, log) = orchestrator(Script {
        fail_construct: Some(StageKind::Sender),
        ..Script::default()
    });
    let (_trigger, gateway) = SignalGateway::channel();

    let err = orchestrator.run(gateway).await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::Construction {
            stage: StageKind::Sender,
            ..
        }
    ));
    let log = entries(&log);
    assert!(!log.contains(&"construct:monitor".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("start:") || e.starts_with("stop:")));
}

#[tokio::test]
async fn test_rapid_signals_shut_down_once() {
    let (orchestrator, log) = orchestrator(Script::default());

    let report = run_to_signal(
        orchestrator,
        &log,
        &[ShutdownSignal::Interrupt, ShutdownSignal::Terminate],
    )
    .await;

    assert_eq!(report.reason, ShutdownReason::Signal(ShutdownSignal::Interrupt));
    let log = entries(&log);
    for kind in StageKind::START_ORDER {
        let stop = format!("stop:{kind}");
        assert_eq!(log.iter().filter(|e| **e == stop).count(), 1, "{stop}");
    }
}

#[tokio::test]
async fn test_stop_error_does_not_skip_remaining_stops() {
    let (orchestrator, log) = orchestrator(Script {
        fail_stop: Some(StageKind::Sender),
        ..Script::default()
    });

    let report = run_to_signal(orchestrator, &log, &[ShutdownSignal::Terminate]).await;

    let log = entries(&log);
    let stops: Vec<&String> = log.iter().filter(|e| e.starts_with("stop:")).collect();
    assert_eq!(
        stops,
        ["stop:monitor", "stop:sender", "stop:processor", "stop:collector"]
    );
    assert_eq!(report.stop_errors.len(), 1);
    assert_eq!(report.stop_errors[0].0, StageKind::Sender);
    assert!(report.stop_errors[0].1.contains("socket still bound"));
    assert!(!report.is_clean());
    assert!(report.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_hung_monitor_stop_bounded_by_shutdown_budget() {
    let (orchestrator, log) = orchestrator(Script {
        hang_stop: Some(StageKind::Monitor),
        ..Script::default()
    });
    let (trigger, gateway) = SignalGateway::channel();
    let mut state = orchestrator.state_receiver();
    let run = tokio::spawn(orchestrator.run(gateway));

    state
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    let shutdown_began = tokio::time::Instant::now();
    trigger.raise(ShutdownSignal::Terminate);

    let report = run.await.unwrap().unwrap();

    assert!(shutdown_began.elapsed() <= Duration::from_secs(31));
    assert_eq!(
        report.unconfirmed,
        [
            StageKind::Monitor,
            StageKind::Sender,
            StageKind::Processor,
            StageKind::Collector
        ]
    );
    assert!(!report.is_clean());
    assert!(entries(&log).contains(&"stop:monitor".to_string()));
    assert_eq!(*state.borrow_and_update(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_stage_fault_cancels_run() {
    let (orchestrator, log) = orchestrator(Script {
        fault_after_start: Some(StageKind::Collector),
        ..Script::default()
    });
    let (_trigger, gateway) = SignalGateway::channel();

    let report = orchestrator.run(gateway).await.unwrap();

    match &report.reason {
        ShutdownReason::StageFault(fault) => {
            assert_eq!(fault.stage, StageKind::Collector);
            assert_eq!(fault.reason, "disk vanished");
        }
        other => panic!("unexpected reason {other:?}"),
    }
    assert!(!report.is_success());

    let log = entries(&log);
    let stops: Vec<&String> = log.iter().filter(|e| e.starts_with("stop:")).collect();
    assert_eq!(
        stops,
        ["stop:monitor", "stop:sender", "stop:processor", "stop:collector"]
    );
}

#[tokio::test]
async fn test_external_handle_cancels_run() {
    let (orchestrator, log) = orchestrator(Script::default());
    let handle = orchestrator.handle();
    let mut state = orchestrator.state_receiver();
    let (_trigger, gateway) = SignalGateway::channel();
    let run = tokio::spawn(orchestrator.run(gateway));

    state
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    handle.shutdown();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.reason, ShutdownReason::Cancelled);
    assert!(report.is_success());
    assert!(handle.is_shutdown_requested());
    assert_eq!(entries(&log).iter().filter(|e| e.starts_with("stop:")).count(), 4);
}
