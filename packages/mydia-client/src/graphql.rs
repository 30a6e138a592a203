//! GraphQL-over-transport carrier.
//!
//! The single entry point application code uses to talk to the server: it
//! serializes an operation together with the current media token, hands the
//! request to the connection manager, and deserializes the response.
//!
//! Retry policy lives here and nowhere else, keyed strictly on the error
//! *type*: transport failures retry with 1s/2s/4s backoff (re-checking the
//! connection before each attempt), while an application-level response —
//! any well-formed body, including one with an `errors` array — is returned
//! to the caller untouched.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result, TransportError};
use crate::manager::ConnectionManager;

/// Path the server exposes its GraphQL endpoint on.
const GRAPHQL_PATH: &str = "/api/graphql";

/// Backoff between retry attempts.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// A deserialized GraphQL response. `errors` being present does not make
/// this a failure at the transport level; callers inspect it.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<Value>>,
}

impl GraphqlResponse {
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }
}

/// Carrier bound to one connection manager and one media token.
pub struct GraphqlCarrier {
    manager: Arc<ConnectionManager>,
    media_token: Mutex<String>,
}

impl GraphqlCarrier {
    pub fn new(manager: Arc<ConnectionManager>, media_token: String) -> Self {
        Self { manager, media_token: Mutex::new(media_token) }
    }

    /// Swap in a refreshed media token.
    pub fn set_media_token(&self, token: String) {
        *self.media_token.lock().unwrap() = token;
    }

    /// Execute one operation. Cancelling `cancel` stops the retry loop
    /// between attempts; callers express timeouts by cancelling the token.
    pub async fn execute(
        &self,
        query: &str,
        operation_name: Option<&str>,
        variables: Value,
        cancel: &CancellationToken,
    ) -> Result<GraphqlResponse> {
        let body = json!({
            "query": query,
            "operationName": operation_name,
            "variables": variables,
        });

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = RETRY_DELAYS[attempt - 1];
                tracing::debug!(attempt, ?delay, "Retrying after transport failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = self.manager.ensure_connected().await {
                    tracing::debug!("Reconnect before retry failed: {e}");
                }
            }

            let result = self.dispatch(&body).await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < RETRY_DELAYS.len() => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&self, body: &Value) -> Result<GraphqlResponse> {
        let token = self.media_token.lock().unwrap().clone();
        let http = self.manager.http().clone();
        let body = body.clone();

        self.manager
            .execute_request(move |tunnel, direct_url| async move {
                if let Some(tunnel) = tunnel {
                    let bytes = serde_json::to_vec(&body)?;
                    let bearer = format!("Bearer {token}");
                    let response = tunnel
                        .request(
                            "POST",
                            GRAPHQL_PATH,
                            &[
                                ("authorization", bearer.as_str()),
                                ("content-type", "application/json"),
                            ],
                            Some(&bytes),
                        )
                        .await?;
                    if !response.is_success() {
                        return Err(ClientError::Api {
                            status: response.status,
                            message: String::from_utf8_lossy(&response.body).into_owned(),
                        });
                    }
                    Ok(response.json()?)
                } else if let Some(url) = direct_url {
                    let response = http
                        .post(format!("{}{}", url.trim_end_matches('/'), GRAPHQL_PATH))
                        .bearer_auth(&token)
                        .json(&body)
                        .send()
                        .await
                        .map_err(TransportError::Http)?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(ClientError::Api {
                            status: status.as_u16(),
                            message: response.text().await.unwrap_or_default(),
                        });
                    }
                    response
                        .json::<GraphqlResponse>()
                        .await
                        .map_err(|e| TransportError::Http(e).into())
                } else {
                    Err(ClientError::Unavailable("no transport selected".into()))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_is_one_two_four_seconds() {
        assert_eq!(
            RETRY_DELAYS,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn response_with_errors_array_is_not_a_transport_failure() {
        let response: GraphqlResponse = serde_json::from_str(
            r#"{"data":null,"errors":[{"message":"field not found"}]}"#,
        )
        .unwrap();
        assert!(response.has_errors());

        let clean: GraphqlResponse =
            serde_json::from_str(r#"{"data":{"library":[]}}"#).unwrap();
        assert!(!clean.has_errors());
    }

    #[tokio::test]
    async fn cancellation_stops_the_retry_loop() {
        use crate::manager::{ConnectionConfig, ConnectionManager};

        // A direct URL that refuses connections makes every attempt a
        // transport failure, so the loop reaches its first backoff sleep.
        let manager = ConnectionManager::new(
            ConnectionConfig {
                direct_urls: vec!["http://127.0.0.1:1".into()],
                force_direct_only: true,
                direct_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            reqwest::Client::new(),
            None,
        );
        {
            // Pretend startup already selected the (dead) direct URL.
            let carrier_manager = manager.clone();
            carrier_manager.note_direct_available("http://127.0.0.1:1");
        }

        let carrier = GraphqlCarrier::new(manager, "token".into());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = carrier
            .execute("query { library }", None, json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
