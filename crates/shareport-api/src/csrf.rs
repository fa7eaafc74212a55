//! Request forgery checks for the approval page
//!
//! The confirm page embeds a one-shot token bound to the signed-in user; the
//! approve post must send it back. Posts whose `Origin` or `Sec-Fetch-Site`
//! names another site are refused before the token is looked at.

use axum::http::{header, HeaderMap};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const TOKEN_LEN: usize = 32;

/// How long a rendered confirm page stays usable
pub const TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
pub struct CsrfTokens {
    issued: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl CsrfTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// New token for a page shown to `user_id`
    pub async fn issue(&self, user_id: Uuid) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        let now = Instant::now();
        let mut issued = self.issued.lock().await;
        issued.retain(|_, (_, at)| now.duration_since(*at) < TOKEN_TTL);
        issued.insert(token.clone(), (user_id, now));
        token
    }

    /// Consume `token`; true only if it was issued to `user_id` and is fresh
    pub async fn verify(&self, token: &str, user_id: Uuid) -> bool {
        let Some((owner, at)) = self.issued.lock().await.remove(token) else {
            return false;
        };
        if owner != user_id {
            debug!("CSRF token presented by {} belongs to {}", user_id, owner);
            return false;
        }
        at.elapsed() < TOKEN_TTL
    }
}

/// True when the browser says the post came from another site
pub fn is_cross_site(headers: &HeaderMap) -> bool {
    if let Some(site) = headers.get("sec-fetch-site").and_then(|v| v.to_str().ok()) {
        if site.eq_ignore_ascii_case("cross-site") {
            return true;
        }
    }

    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let origin_host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .trim_end_matches('/');

    match host {
        Some(host) => !origin_host.eq_ignore_ascii_case(host),
        // Opaque origins ("null") with no Host to compare against
        None => true,
    }
}
