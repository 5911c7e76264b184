// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal gateway.
//!
//! Turns SIGINT/SIGTERM into a single wake event delivered over a capacity-1 channel. The
//! orchestrator consumes exactly one event; signals arriving while one is buffered, or after
//! the gateway fired, are coalesced.

use std::fmt;
use std::future;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Termination signal that triggered a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C).
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Producer side of the gateway. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SignalTrigger {
    tx: mpsc::Sender<ShutdownSignal>,
}

impl SignalTrigger {
    /// Raises a signal. Returns `false` when it was coalesced into an already pending one or
    /// nobody is listening anymore.
    pub fn raise(&self, signal: ShutdownSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(%signal, "Shutdown already signaled, coalescing");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%signal, "Signal gateway closed, ignoring");
                false
            }
        }
    }
}

/// Single-fire wake event for process termination signals.
#[derive(Debug)]
pub struct SignalGateway {
    rx: mpsc::Receiver<ShutdownSignal>,
    fired: bool,
    listener: Option<JoinHandle<()>>,
}

impl SignalGateway {
    /// A gateway fed only by the returned trigger.
    #[must_use]
    pub fn channel() -> (SignalTrigger, SignalGateway) {
        let (tx, rx) = mpsc::channel(1);
        (
            SignalTrigger { tx },
            SignalGateway {
                rx,
                fired: false,
                listener: None,
            },
        )
    }

    /// Registers SIGINT and SIGTERM handlers (SIGINT only on non-Unix platforms).
    ///
    /// Must be called from within a tokio runtime with the signal driver enabled.
    pub fn install() -> std::io::Result<Self> {
        let (trigger, mut gateway) = Self::channel();
        gateway.listener = Some(spawn_listener(trigger)?);
        Ok(gateway)
    }

    /// Waits for the first signal.
    ///
    /// Once a signal was returned, or when every trigger is gone, this never resolves.
    pub async fn wait(&mut self) -> ShutdownSignal {
        if !self.fired {
            if let Some(signal) = self.rx.recv().await {
                self.fired = true;
                return signal;
            }
        }
        future::pending().await
    }
}

impl Drop for SignalGateway {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(unix)]
fn spawn_listener(trigger: SignalTrigger) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = sigint.recv() => ShutdownSignal::Interrupt,
                Some(()) = sigterm.recv() => ShutdownSignal::Terminate,
                else => break,
            };
            info!(signal = %received, "Received termination signal");
            trigger.raise(received);
        }
    }))
}

#[cfg(not(unix))]
fn spawn_listener(trigger: SignalTrigger) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = %ShutdownSignal::Interrupt, "Received termination signal");
            trigger.raise(ShutdownSignal::Interrupt);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_first_signal_wakes() {
        let (trigger, mut gateway) = SignalGateway::channel();
        assert!(trigger.raise(ShutdownSignal::Terminate));
        assert_eq!(gateway.wait().await, ShutdownSignal::Terminate);
    }

    #[tokio::test]
    async fn test_rapid_signals_are_coalesced() {
        let (trigger, mut gateway) = SignalGateway::channel();
        assert!(trigger.raise(ShutdownSignal::Interrupt));
        assert!(!trigger.raise(ShutdownSignal::Terminate));

        assert_eq!(gateway.wait().await, ShutdownSignal::Interrupt);
        assert!(timeout(Duration::from_millis(50), gateway.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_gateway_fires_only_once() {
        let (trigger, mut gateway) = SignalGateway::channel();
        trigger.raise(ShutdownSignal::Interrupt);
        gateway.wait().await;

        trigger.raise(ShutdownSignal::Terminate);
        assert!(timeout(Duration::from_millis(50), gateway.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_wakes() {
        let (trigger, mut gateway) = SignalGateway::channel();
        drop(trigger);
        assert!(timeout(Duration::from_millis(50), gateway.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_raise_after_gateway_dropped() {
        let (trigger, gateway) = SignalGateway::channel();
        drop(gateway);
        assert!(!trigger.raise(ShutdownSignal::Terminate));
    }

    #[tokio::test]
    async fn test_install_registers_handlers() {
        let gateway = SignalGateway::install().unwrap();
        assert!(gateway.listener.is_some());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
