// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed, take-once pipeline endpoints.
//!
//! ```text
//!   producer stage                          consumer stage
//!   ┌───────────┐   OutputEndpoint<T>       ┌────────────┐
//!   │  Emitter  │◄──────────┐     ┌────────►│  Receiver  │
//!   └───────────┘           │     │         └────────────┘
//!                       connect(out, in)
//!                                 │
//!                        InputEndpoint<T> (bounded mpsc sender)
//! ```
//!
//! A producer creates an [`Emitter`] and hands the matching [`OutputEndpoint`] to the
//! orchestrator. A consumer creates its bounded channel and hands the [`InputEndpoint`] to
//! the orchestrator. [`connect`] consumes both, so a pair can only ever be wired once and an
//! endpoint can never fan out.
//!
//! Until the emitter is attached it holds records back (the emitting task waits) instead of
//! dropping them, so a producer that starts before wiring loses nothing.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// The consumer end is gone, or the producer was never wired and its endpoint was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pipeline endpoint detached")]
pub struct Detached;

/// Output endpoint of a producer stage, consumed by [`connect`].
#[derive(Debug)]
pub struct OutputEndpoint<T> {
    attach: oneshot::Sender<mpsc::Sender<T>>,
}

/// Input endpoint of a consumer stage, consumed by [`connect`].
#[derive(Debug)]
pub struct InputEndpoint<T> {
    tx: mpsc::Sender<T>,
}

enum EmitterState<T> {
    Pending(oneshot::Receiver<mpsc::Sender<T>>),
    Attached(mpsc::Sender<T>),
    Detached,
}

/// Producer-side handle used to push records downstream.
pub struct Emitter<T> {
    state: EmitterState<T>,
}

/// Creates a producer's output endpoint and the emitter that writes through it.
#[must_use]
pub fn output<T>() -> (OutputEndpoint<T>, Emitter<T>) {
    let (attach, pending) = oneshot::channel();
    (
        OutputEndpoint { attach },
        Emitter {
            state: EmitterState::Pending(pending),
        },
    )
}

/// Creates a consumer's bounded input channel. A capacity of zero is raised to one.
#[must_use]
pub fn input<T>(capacity: usize) -> (InputEndpoint<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InputEndpoint { tx }, rx)
}

/// Attaches a producer's output to a consumer's input.
///
/// Both endpoints are moved in, which rules out wiring the same pair twice.
pub fn connect<T>(producer: OutputEndpoint<T>, consumer: InputEndpoint<T>) {
    if producer.attach.send(consumer.tx).is_err() {
        debug!("Producer released its emitter before wiring, connection discarded");
    }
}

impl<T> Emitter<T> {
    /// Sends a record downstream, waiting for wiring and for channel capacity.
    pub async fn emit(&mut self, item: T) -> Result<(), Detached> {
        let result = match self.attached().await {
            Ok(tx) => tx.send(item).await.map_err(|_| Detached),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.state = EmitterState::Detached;
        }
        result
    }

    /// Whether the emitter has been wired and the consumer is still there.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(&self.state, EmitterState::Attached(tx) if !tx.is_closed())
    }

    async fn attached(&mut self) -> Result<&mpsc::Sender<T>, Detached> {
        if let EmitterState::Pending(pending) = &mut self.state {
            self.state = match pending.await {
                Ok(tx) => EmitterState::Attached(tx),
                Err(_) => EmitterState::Detached,
            };
        }
        match &self.state {
            EmitterState::Attached(tx) => Ok(tx),
            EmitterState::Pending(_) | EmitterState::Detached => Err(Detached),
        }
    }
}
