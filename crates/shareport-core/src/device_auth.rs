//! Device authorization service
//!
//! Issues device codes and mediates their approval by a human in a browser.
//! The service keeps no state between calls: expiry is evaluated lazily by
//! whichever call reads a pending row after its deadline.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{DeviceRequest, DeviceStatus};
use crate::store::{SessionStore, StoreError};

/// Unambiguous characters only (no 0/O, 1/I/L)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Length of a generated device code
pub const DEVICE_CODE_LEN: usize = 8;

/// Attempts at finding an unused code before giving up
const MAX_CODE_ATTEMPTS: usize = 5;

/// Device authorization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceAuthError {
    #[error("Device code not found: {0}")]
    NotFound(String),

    /// The request was already approved or expired; carries the row as it stands
    #[error("Device code already {}", .0.status)]
    AlreadyResolved(Box<DeviceRequest>),

    #[error("Device code expired: {0}")]
    Expired(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Generate a fresh human-readable device code
pub fn generate_device_code() -> String {
    let mut rng = rand::thread_rng();
    (0..DEVICE_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Browser URL where a human approves `device_code`
pub fn verification_url(origin: &str, device_code: &str) -> String {
    format!("{}/device?code={}", origin.trim_end_matches('/'), device_code)
}

/// Device authorization service
#[derive(Clone)]
pub struct DeviceAuthService {
    store: Arc<dyn SessionStore>,
}

impl DeviceAuthService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Issue a new pending request under a code nobody else holds
    pub async fn create_request(&self) -> Result<DeviceRequest, DeviceAuthError> {
        let mut last_conflict = None;

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = generate_device_code();
            match self.store.insert_device_request(&code).await {
                Ok(request) => {
                    info!(
                        "Issued device code {} (expires {})",
                        request.device_code, request.expires_at
                    );
                    return Ok(request);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!("Device code collision on attempt {}: {}", attempt, reason);
                    last_conflict = Some(reason);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict(
            last_conflict.unwrap_or_else(|| "no unused device code found".to_string()),
        )
        .into())
    }

    /// Approve a pending request on behalf of `user_id`.
    ///
    /// The first successful approval wins; later calls get
    /// [`DeviceAuthError::AlreadyResolved`] and never reassign `user_id`.
    pub async fn approve(
        &self,
        device_code: &str,
        user_id: Uuid,
    ) -> Result<DeviceRequest, DeviceAuthError> {
        let request = self.find(device_code).await?;

        if request.status.is_terminal() {
            return Err(DeviceAuthError::AlreadyResolved(Box::new(request)));
        }

        if request.is_past_deadline(Utc::now()) {
            self.expire(&request).await;
            return Err(DeviceAuthError::Expired(device_code.to_string()));
        }

        let approved = self
            .store
            .transition_device_request(
                device_code,
                DeviceStatus::Pending,
                DeviceStatus::Approved,
                Some(user_id),
            )
            .await?;

        let current = self.find(device_code).await?;
        if approved {
            info!("Device code {} approved by {}", device_code, user_id);
            return Ok(current);
        }

        // Lost the race to another approval or to expiry
        match current.status {
            DeviceStatus::Expired => Err(DeviceAuthError::Expired(device_code.to_string())),
            _ => Err(DeviceAuthError::AlreadyResolved(Box::new(current))),
        }
    }

    /// Read a request as of now. A pending row past its deadline is reported
    /// (and recorded) as expired.
    pub async fn get_status(&self, device_code: &str) -> Result<DeviceRequest, DeviceAuthError> {
        let request = self.find(device_code).await?;

        if request.effective_status(Utc::now()) != DeviceStatus::Expired
            || request.status == DeviceStatus::Expired
        {
            return Ok(request);
        }

        if self.expire(&request).await {
            return Ok(DeviceRequest {
                status: DeviceStatus::Expired,
                ..request
            });
        }

        // Someone else resolved it between our read and the transition
        let current = self.find(device_code).await?;
        match current.status {
            DeviceStatus::Pending => Ok(DeviceRequest {
                status: DeviceStatus::Expired,
                ..current
            }),
            _ => Ok(current),
        }
    }

    async fn find(&self, device_code: &str) -> Result<DeviceRequest, DeviceAuthError> {
        self.store
            .find_device_request(device_code)
            .await?
            .ok_or_else(|| DeviceAuthError::NotFound(device_code.to_string()))
    }

    /// Record expiry of a pending row; returns whether this call performed it
    async fn expire(&self, request: &DeviceRequest) -> bool {
        match self
            .store
            .transition_device_request(
                &request.device_code,
                DeviceStatus::Pending,
                DeviceStatus::Expired,
                None,
            )
            .await
        {
            Ok(expired) => {
                if expired {
                    debug!("Device code {} expired", request.device_code);
                }
                expired
            }
            Err(e) => {
                warn!(
                    "Failed to record expiry of device code {}: {}",
                    request.device_code, e
                );
                false
            }
        }
    }
}
