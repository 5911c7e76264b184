// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound each stage gives its own tasks to finish during `stop`.
pub(crate) const STAGE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a consumer waits for its input to close before it stops taking new records.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Waits for every task in `tasks`. Whatever is still running after `limit` is aborted.
///
/// Returns `false` when tasks had to be aborted.
pub(crate) async fn join_within(stage: &str, tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    let joined = tokio::time::timeout(limit, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                debug!(stage, "Task ended abnormally: {e}");
            }
        }
    })
    .await;

    if joined.is_err() {
        warn!(
            stage,
            remaining = tasks.len(),
            "Tasks did not finish in time, aborting"
        );
        tasks.abort_all();
        return false;
    }
    true
}

/// Lets a consumer task run until its input closes, at most `grace`. Then `stop` is
/// cancelled so the task drains what is buffered and exits, bounded by `limit`.
///
/// Returns `false` when the task had to be aborted.
pub(crate) async fn finish_consumer(
    stage: &str,
    mut task: JoinHandle<()>,
    stop: &CancellationToken,
    grace: Duration,
    limit: Duration,
) -> bool {
    if tokio::time::timeout(grace, &mut task).await.is_ok() {
        return true;
    }

    debug!(stage, "Input still open, draining buffered records");
    stop.cancel();
    if tokio::time::timeout(limit, &mut task).await.is_ok() {
        return true;
    }

    warn!(stage, "Task did not finish in time, aborting");
    task.abort();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_within_waits_for_tasks() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });

        assert!(join_within("test", &mut tasks, Duration::from_secs(1)).await);
        assert!(tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_within_aborts_stragglers() {
        let mut tasks = JoinSet::new();
        tasks.spawn(std::future::pending::<()>());

        assert!(!join_within("test", &mut tasks, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_finish_consumer_waits_for_natural_end() {
        let stop = CancellationToken::new();
        let task = tokio::spawn(async {});

        assert!(
            finish_consumer("test", task, &stop, Duration::from_secs(1), Duration::from_secs(1))
                .await
        );
        assert!(!stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_consumer_cancels_after_grace() {
        let stop = CancellationToken::new();
        let observed = stop.clone();
        let task = tokio::spawn(async move { observed.cancelled().await });

        assert!(
            finish_consumer("test", task, &stop, Duration::from_secs(2), Duration::from_secs(5))
                .await
        );
        assert!(stop.is_cancelled());
    }
}
