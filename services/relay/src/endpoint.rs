//! Management-endpoint client.
//!
//! Speaks the management protocol's event-service collection over HTTPS
//! with basic auth:
//!
//! 1. `open` probes `https://<host>/redfish/v1/` within the retry budget
//! 2. `list_subscriptions` walks `EventService/Subscriptions` members
//! 3. `create_subscription` POSTs a desired record to the collection
//! 4. `delete_subscription` DELETEs by server-assigned handle
//!
//! BMCs ship self-signed certificates, so certificate validation is off.
//! A session belongs to exactly one reconcile attempt; dropping it is the
//! best-effort close.

use relay_protocol::{DesiredSubscription, LiveSubscription};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const API_ROOT: &str = "/redfish/v1";
const SUBSCRIPTIONS: &str = "/redfish/v1/EventService/Subscriptions";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Connect/transport failure or timeout; the endpoint is skipped this cycle.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint rejected the configured credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Reachable but answered outside the protocol contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated session against one endpoint.
pub struct EndpointSession {
    client: reqwest::Client,
    host: String,
    base: String,
    username: String,
    password: String,
    retries: u32,
}

impl EndpointSession {
    /// Open a session: build the client and probe the API root.
    pub async fn open(
        host: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| EndpointError::Unreachable(e.to_string()))?;

        let session = EndpointSession {
            client,
            host: host.to_owned(),
            base: format!("https://{}", host),
            username: username.to_owned(),
            password: password.to_owned(),
            retries,
        };

        // The service root does not require auth on every firmware, so an
        // auth problem may only surface on the collection operations.
        session.get_with_retry(API_ROOT).await?;
        Ok(session)
    }

    /// The endpoint hostname this session is bound to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// List the endpoint's current event subscriptions.
    pub async fn list_subscriptions(&self) -> Result<Vec<LiveSubscription>, EndpointError> {
        let collection: MemberCollection =
            parse_body(self.get_with_retry(SUBSCRIPTIONS).await?).await?;

        let mut subs = Vec::with_capacity(collection.members.len());
        for member in collection.members {
            let Some(path) = member.odata_id else {
                continue;
            };
            match parse_body::<LiveSubscription>(self.get_with_retry(&path).await?).await {
                Ok(mut sub) => {
                    if sub.handle.is_empty() {
                        sub.handle = path;
                    }
                    subs.push(sub);
                }
                // A member that vanished between list and fetch is not fatal.
                Err(e) => debug!(endpoint = %self.host, member = %path, error = %e,
                    "skipping unreadable subscription member"),
            }
        }
        Ok(subs)
    }

    /// Create a subscription; returns the live record with its new handle.
    pub async fn create_subscription(
        &self,
        desired: &DesiredSubscription,
    ) -> Result<LiveSubscription, EndpointError> {
        let url = format!("{}{}", self.base, SUBSCRIPTIONS);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(desired)
            .send()
            .await
            .map_err(|e| EndpointError::Unreachable(e.to_string()))?;
        let response = check_status(response)?;

        let handle = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        if handle.is_empty() {
            warn!(endpoint = %self.host, context = %desired.context,
                "created subscription without a Location header");
        }

        Ok(LiveSubscription {
            handle,
            destination: desired.destination.clone(),
            context: desired.context.clone(),
            registry_prefixes: desired.registry_prefixes.clone(),
            exclude_registry_prefixes: desired.exclude_registry_prefixes.clone(),
            message_ids: desired.message_ids.clone(),
            exclude_message_ids: desired.exclude_message_ids.clone(),
            protocol: desired.protocol.clone(),
        })
    }

    /// Delete a subscription by handle.
    pub async fn delete_subscription(&self, handle: &str) -> Result<(), EndpointError> {
        let url = format!("{}{}", self.base, handle);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| EndpointError::Unreachable(e.to_string()))?;
        check_status(response)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn get_with_retry(&self, path: &str) -> Result<reqwest::Response, EndpointError> {
        let url = format!("{}{}", self.base, path);
        let mut last_err = EndpointError::Unreachable("no attempt made".to_owned());
        for attempt in 0..=self.retries {
            let result = self
                .client
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await;
            match result {
                Ok(response) => return check_status(response),
                Err(e) => {
                    debug!(endpoint = %self.host, attempt, error = %e, "request failed");
                    last_err = EndpointError::Unreachable(e.to_string());
                }
            }
        }
        Err(last_err)
    }
}

/// Map HTTP status classes onto the error taxonomy.
fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EndpointError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(EndpointError::Auth(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(EndpointError::Protocol(format!("HTTP {}", status)));
    }
    Ok(response)
}

async fn parse_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, EndpointError> {
    response
        .json::<T>()
        .await
        .map_err(|e| EndpointError::Protocol(format!("JSON parse: {}", e)))
}

// ---------------------------------------------------------------------------
// Collection wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MemberCollection {
    #[serde(rename = "Members", default)]
    members: Vec<MemberRef>,
}

#[derive(Debug, Deserialize)]
struct MemberRef {
    #[serde(rename = "@odata.id", default)]
    odata_id: Option<String>,
}
