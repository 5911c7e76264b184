// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared HTTP client construction for the sender and the heartbeat.

use core::time::Duration;

use tracing::error;

/// Product token sent as `User-Agent`.
pub const USER_AGENT: &str = concat!("siem-agent/", env!("CARGO_PKG_VERSION"));

/// Builds a client with the given request timeout.
///
/// Falls back to reqwest's defaults when the configured builder cannot be built, so the
/// agent keeps running with a plain client instead of failing to start.
#[must_use]
pub fn get_client(timeout: Duration) -> reqwest::Client {
    match build_client(timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_sends_user_agent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .create_async()
            .await;

        let client = get_client(Duration::from_secs(2));
        let response = client
            .get(format!("{}/ping", server.url()))
            .send()
            .await
            .unwrap();

        assert!(response.status().is_success());
        mock.assert_async().await;
    }
}
