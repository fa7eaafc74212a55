//! CLI side of the device-code handshake
//!
//! The poller reads the request on a fixed interval until a human approves it,
//! the code expires, or the attempt budget runs out. It never writes to the
//! request itself except through the lazy expiry recorded by
//! [`DeviceAuthService::get_status`].

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device_auth::{DeviceAuthError, DeviceAuthService};
use crate::model::{DeviceRequest, DeviceStatus};
use crate::store::StoreError;

/// Login failures, each with its own remedy
#[derive(Debug, Error)]
pub enum LoginError {
    /// The code rotted server-side; start over with a new code
    #[error("Device code {0} expired before it was approved")]
    Expired(String),

    /// Nobody approved within the polling window
    #[error("Nobody approved the request within {}s ({attempts} attempts)", .waited.as_secs())]
    Timeout { attempts: u32, waited: Duration },

    #[error("Login cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to save credentials: {0}")]
    Credentials(String),
}

impl From<DeviceAuthError> for LoginError {
    fn from(err: DeviceAuthError) -> Self {
        match err {
            DeviceAuthError::Expired(code) => LoginError::Expired(code),
            DeviceAuthError::Store(e) => LoginError::Store(e),
            DeviceAuthError::NotFound(code) => {
                LoginError::Store(StoreError::NotFound(format!("device code {}", code)))
            }
            DeviceAuthError::AlreadyResolved(request) => LoginError::Store(StoreError::Conflict(
                format!("device code {} already {}", request.device_code, request.status),
            )),
        }
    }
}

/// Polling cadence. Both the interval and the total wait are bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    /// Longest a login can wait for approval
    pub fn timeout(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

/// Identity granted by an approved device request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant {
    pub user_id: Uuid,
    pub device_code: String,
}

pub struct DevicePoller {
    auth: DeviceAuthService,
    config: PollConfig,
}

impl DevicePoller {
    pub fn new(auth: DeviceAuthService, config: PollConfig) -> Self {
        Self { auth, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Request a fresh device code. Any store failure here is fatal to the login.
    pub async fn start(&self) -> Result<DeviceRequest, LoginError> {
        Ok(self.auth.create_request().await?)
    }

    /// Poll until the request resolves, the attempt budget is spent, or `cancel`
    /// completes. Cancellation leaves the request untouched to expire on its own.
    pub async fn poll<C>(&self, device_code: &str, cancel: C) -> Result<DeviceGrant, LoginError>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let started = Instant::now();

        for attempt in 1..=self.config.max_attempts {
            tokio::select! {
                _ = &mut cancel => return Err(self.cancelled(device_code)),
                _ = sleep(self.config.interval) => {}
            }

            let result = tokio::select! {
                _ = &mut cancel => return Err(self.cancelled(device_code)),
                result = self.auth.get_status(device_code) => result,
            };

            match result {
                Ok(request) => match (request.status, request.user_id) {
                    (DeviceStatus::Approved, Some(user_id)) => {
                        info!("Device code {} approved after {} attempts", device_code, attempt);
                        return Ok(DeviceGrant {
                            user_id,
                            device_code: device_code.to_string(),
                        });
                    }
                    (DeviceStatus::Expired, _) => {
                        return Err(LoginError::Expired(device_code.to_string()));
                    }
                    (status, _) => {
                        debug!(
                            "Poll {}/{} for {}: {}",
                            attempt, self.config.max_attempts, device_code, status
                        );
                    }
                },
                Err(DeviceAuthError::Expired(code)) => return Err(LoginError::Expired(code)),
                Err(DeviceAuthError::Store(e)) if e.is_unavailable() => {
                    return Err(LoginError::Store(e));
                }
                Err(DeviceAuthError::NotFound(_)) => {
                    debug!(
                        "Poll {}/{} for {}: not found yet",
                        attempt, self.config.max_attempts, device_code
                    );
                }
                Err(e) => {
                    warn!(
                        "Poll {}/{} for {} failed: {}",
                        attempt, self.config.max_attempts, device_code, e
                    );
                }
            }
        }

        let waited = started.elapsed();
        info!(
            "Gave up on device code {} after {} attempts ({:?})",
            device_code, self.config.max_attempts, waited
        );
        Err(LoginError::Timeout {
            attempts: self.config.max_attempts,
            waited,
        })
    }

    fn cancelled(&self, device_code: &str) -> LoginError {
        info!("Login cancelled while waiting on {}", device_code);
        LoginError::Cancelled
    }
}
