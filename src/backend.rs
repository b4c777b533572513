// src/backend.rs
//
// Forwards decoded readings to the HTTP backend.
// Login is retried a fixed number of times; the bearer token is kept until
// it expires or the backend rejects it. Forwarding is best effort: a failed
// upload is logged and the link keeps running.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::events::LinkEvent;
use crate::io::serial::SensorReading;
use crate::settings::BackendSettings;

const LOGIN_PATH: &str = "/api/auth/login";
const READINGS_PATH: &str = "/api/devices/readings";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Tokens this close to expiry are renewed before use
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenInfo {
    token: String,
    ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Clone)]
struct AuthToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AuthToken {
    fn from_info(info: TokenInfo, issued_at: Instant) -> Self {
        Self {
            value: info.token,
            expires_at: info.ttl_ms.map(|ms| issued_at + Duration::from_millis(ms)),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now + TOKEN_EXPIRY_MARGIN < expires_at,
            None => true,
        }
    }
}

/// Authenticated client for the readings API
pub struct BackendClient {
    settings: BackendSettings,
    http: reqwest::Client,
    token: Option<AuthToken>,
}

impl BackendClient {
    pub fn new(settings: BackendSettings) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sensorlink/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            settings,
            http,
            token: None,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Log in, retrying with a fixed delay.
    pub async fn login(&mut self) -> Result<(), String> {
        let attempts = self.settings.login_attempts.max(1);
        let delay = Duration::from_millis(self.settings.login_retry_delay_ms);

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.attempt_login().await {
                Ok(token) => {
                    self.token = Some(token);
                    tlog!("[backend] Login successful");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e;
                    if attempt < attempts {
                        tlog!(
                            "[backend] Login failed ({}). Retrying in {} ms, {} attempts remaining",
                            last_error,
                            delay.as_millis(),
                            attempts - attempt
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.token = None;
        Err(format!(
            "Login failed after {} attempts: {}",
            attempts, last_error
        ))
    }

    async fn attempt_login(&self) -> Result<AuthToken, String> {
        let body = serde_json::json!({
            "username": self.settings.username,
            "password": self.settings.password,
        });

        let issued_at = Instant::now();
        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Network error: {}", e))?;

        if !response.status().is_success() {
            return Err(describe_failure(response).await);
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse login response: {}", e))?;
        Ok(AuthToken::from_info(auth.token, issued_at))
    }

    async fn ensure_token(&mut self) -> Result<String, String> {
        let fresh = self
            .token
            .as_ref()
            .filter(|t| t.is_fresh(Instant::now()))
            .map(|t| t.value.clone());
        match fresh {
            Some(token) => Ok(token),
            None => {
                self.login().await?;
                self.token
                    .as_ref()
                    .map(|t| t.value.clone())
                    .ok_or_else(|| "Missing token after login".to_string())
            }
        }
    }

    /// Upload one reading. A rejected token triggers one fresh login.
    pub async fn send_reading(&mut self, reading: &SensorReading) -> Result<(), String> {
        let token = self.ensure_token().await?;
        let status = self.post_reading(&token, reading).await?;
        if status != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        tlog!("[backend] Token rejected, logging in again");
        self.token = None;
        let token = self.ensure_token().await?;
        match self.post_reading(&token, reading).await? {
            reqwest::StatusCode::UNAUTHORIZED => {
                Err("Backend rejected credentials after re-login".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Returns the status when it is success or 401; other failures are errors.
    async fn post_reading(
        &self,
        token: &str,
        reading: &SensorReading,
    ) -> Result<reqwest::StatusCode, String> {
        let response = self
            .http
            .post(self.endpoint(READINGS_PATH))
            .bearer_auth(token)
            .json(reading)
            .send()
            .await
            .map_err(|e| format!("Failed to send reading: {}", e))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::UNAUTHORIZED {
            Ok(status)
        } else {
            Err(describe_failure(response).await)
        }
    }
}

async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    let message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.message);
    match message {
        Some(m) => format!("{} ({})", m, status),
        None => format!("Backend returned status: {}", status),
    }
}

/// Upload every `sensorData` event until the link shuts down.
pub fn spawn_forwarder(
    mut client: BackendClient,
    mut events: broadcast::Receiver<LinkEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::SensorData(reading)) => {
                    if let Err(e) = client.send_reading(&reading).await {
                        tlog!("[backend] Dropped reading from {}: {}", reading.device_id, e);
                    }
                }
                Ok(LinkEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tlog!("[backend] Forwarder fell behind, skipped {} events", n);
                }
            }
        }
        tlog!("[backend] Forwarder stopped");
    })
}
