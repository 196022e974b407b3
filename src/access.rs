//! Session resolution and mentor-assignment lookups.
//!
//! The service does not issue sessions itself; it asks the platform auth
//! service who a bearer token belongs to and whether a mentor is assigned to
//! a trader's account. Both lookups sit behind a trait so handlers and the
//! modification pipeline can be tested against a scripted directory.

use crate::domain::{Actor, Role};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Directory of who is who: sessions and mentor assignments.
#[async_trait]
pub trait AccessDirectory: Send + Sync + fmt::Debug {
    /// Resolve a bearer token to an actor, or None for an unknown/expired one.
    ///
    /// # Errors
    /// Returns an error when the directory itself cannot be reached.
    async fn resolve_session(&self, token: &str) -> Result<Option<Actor>, AccessError>;

    /// Whether `mentor_id` is assigned to the trader owning `account_id`.
    ///
    /// # Errors
    /// Returns an error when the directory itself cannot be reached.
    async fn is_mentor_assigned(&self, mentor_id: &str, account_id: &str)
        -> Result<bool, AccessError>;
}

/// Error type for directory lookups.
#[derive(Debug, Clone)]
pub enum AccessError {
    /// Network error (connection refused, DNS failure, ...).
    Network(String),
    /// HTTP error from the auth service.
    Http { status: u16, message: String },
    /// Malformed or unexpected response body.
    Parse(String),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Network(msg) => write!(f, "Network error: {}", msg),
            AccessError::Http { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            AccessError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for AccessError {}

/// Directory backed by the platform auth service.
#[derive(Debug, Clone)]
pub struct HttpAccessDirectory {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    user_id: String,
    display_name: String,
    role: String,
}

#[derive(Debug, Deserialize)]
struct AssignmentResponse {
    assigned: bool,
}

impl HttpAccessDirectory {
    /// Create a directory against `base_url` (no trailing slash).
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, AccessError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(2)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(AccessError::Network(e.to_string())))?;

            let status = response.status();
            if status == 404 {
                return Ok(None);
            }
            if status.is_server_error() || status == 429 {
                return Err(backoff::Error::transient(AccessError::Http {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(AccessError::Http {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| backoff::Error::permanent(AccessError::Parse(e.to_string())))
        })
        .await
    }
}

#[async_trait]
impl AccessDirectory for HttpAccessDirectory {
    async fn resolve_session(&self, token: &str) -> Result<Option<Actor>, AccessError> {
        debug!("resolving session token");
        let url = format!("{}/api/sessions/{}", self.base_url, token);
        let Some(session) = self.get_json::<SessionResponse>(&url).await? else {
            return Ok(None);
        };

        let role = Role::from_str(&session.role)
            .map_err(|e| AccessError::Parse(format!("bad role {:?}: {}", session.role, e)))?;

        Ok(Some(Actor::new(
            &session.user_id,
            &session.display_name,
            role,
        )))
    }

    async fn is_mentor_assigned(
        &self,
        mentor_id: &str,
        account_id: &str,
    ) -> Result<bool, AccessError> {
        let url = format!(
            "{}/api/mentors/{}/assignments/{}",
            self.base_url, mentor_id, account_id
        );
        let assignment = self.get_json::<AssignmentResponse>(&url).await?;
        Ok(assignment.map(|a| a.assigned).unwrap_or(false))
    }
}

/// Scripted directory for tests.
#[derive(Debug, Clone, Default)]
pub struct MockAccessDirectory {
    sessions: HashMap<String, Actor>,
    assignments: HashSet<(String, String)>,
}

impl MockAccessDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a bearer token to an actor.
    pub fn with_session(mut self, token: &str, actor: Actor) -> Self {
        self.sessions.insert(token.to_string(), actor);
        self
    }

    /// Mark `mentor_id` as assigned to `account_id`.
    pub fn with_assignment(mut self, mentor_id: &str, account_id: &str) -> Self {
        self.assignments
            .insert((mentor_id.to_string(), account_id.to_string()));
        self
    }
}

#[async_trait]
impl AccessDirectory for MockAccessDirectory {
    async fn resolve_session(&self, token: &str) -> Result<Option<Actor>, AccessError> {
        Ok(self.sessions.get(token).cloned())
    }

    async fn is_mentor_assigned(
        &self,
        mentor_id: &str,
        account_id: &str,
    ) -> Result<bool, AccessError> {
        Ok(self
            .assignments
            .contains(&(mentor_id.to_string(), account_id.to_string())))
    }
}
