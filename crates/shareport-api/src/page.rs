//! Browser side of the device authorization flow
//!
//! `shareport login` prints a link to `GET /device?code=...`. A signed-in user
//! sees the code and an approve button; the button posts to `/device/approve`,
//! which goes through [`shareport_core::DeviceAuthService::approve`].
//! The post is only honored with the confirm page's token from the same site
//! (see [`crate::csrf`]).

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension, Form,
};
use chrono::Utc;
use shareport_core::{DeviceAuthError, DeviceRequest, DeviceStatus, SessionStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::csrf::is_cross_site;
use crate::middleware::Caller;
use crate::models::{ApproveForm, DevicePageQuery};
use crate::AppState;

/// What the page shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// No code in the link
    EnterCode,
    /// Pending and the viewer is signed in
    Confirm { code: String, csrf_token: String },
    Approved { code: String },
    Expired { code: String },
    AlreadyUsed { code: String },
    NotFound { code: String },
    SignInRequired { code: String },
    /// Cross-site post or stale confirm page
    Forbidden { code: String },
    Unavailable,
}

impl PageState {
    fn status(&self) -> StatusCode {
        match self {
            PageState::EnterCode | PageState::Confirm { .. } | PageState::Approved { .. } => {
                StatusCode::OK
            }
            PageState::Expired { .. } => StatusCode::GONE,
            PageState::AlreadyUsed { .. } => StatusCode::CONFLICT,
            PageState::NotFound { .. } => StatusCode::NOT_FOUND,
            PageState::SignInRequired { .. } => StatusCode::UNAUTHORIZED,
            PageState::Forbidden { .. } => StatusCode::FORBIDDEN,
            PageState::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> String {
        match self {
            PageState::EnterCode => r#"<h1>Connect a device</h1>
<form method="get" action="/device">
  <label>Code shown in your terminal <input name="code" autocomplete="off" autofocus></label>
  <button type="submit">Continue</button>
</form>"#
                .to_string(),
            PageState::Confirm { code, csrf_token } => format!(
                r#"<h1>Connect a device</h1>
<p>Confirm that your terminal shows <code>{code}</code>.</p>
<form method="post" action="/device/approve">
  <input type="hidden" name="code" value="{code}">
  <input type="hidden" name="csrf_token" value="{csrf_token}">
  <button type="submit">Approve</button>
</form>"#,
                code = escape(code),
                csrf_token = escape(csrf_token)
            ),
            PageState::Approved { code } => format!(
                "<h1>Approved</h1>\n<p>Device <code>{}</code> is signed in. You can close this tab.</p>",
                escape(code)
            ),
            PageState::Expired { code } => format!(
                "<h1>Expired</h1>\n<p>Code <code>{}</code> has expired. Run <code>shareport login</code> again.</p>",
                escape(code)
            ),
            PageState::AlreadyUsed { code } => format!(
                "<h1>Already used</h1>\n<p>Code <code>{}</code> has already been approved.</p>",
                escape(code)
            ),
            PageState::NotFound { code } => format!(
                "<h1>Not found</h1>\n<p>No pending login uses code <code>{}</code>.</p>",
                escape(code)
            ),
            PageState::SignInRequired { code } => format!(
                "<h1>Sign-in required</h1>\n<p>Sign in, then reopen this link to approve code <code>{}</code>.</p>",
                escape(code)
            ),
            PageState::Forbidden { code } => format!(
                "<h1>Request refused</h1>\n<p>Open <a href=\"/device?code={0}\">the approval page</a> again to approve code <code>{0}</code>.</p>",
                escape(code)
            ),
            PageState::Unavailable => {
                "<h1>Try again</h1>\n<p>The service is temporarily unavailable.</p>".to_string()
            }
        }
    }
}

impl IntoResponse for PageState {
    fn into_response(self) -> Response {
        let html = format!(
            "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>shareport</title></head>\n<body>\n{}\n</body></html>\n",
            self.body()
        );
        (self.status(), Html(html)).into_response()
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Final page for a resolved request; `Err` hands the code back while pending
fn resolved_state(code: String, request: &DeviceRequest) -> Result<PageState, String> {
    match request.effective_status(Utc::now()) {
        DeviceStatus::Approved => Ok(PageState::AlreadyUsed { code }),
        DeviceStatus::Expired => Ok(PageState::Expired { code }),
        DeviceStatus::Pending => Err(code),
    }
}

async fn confirm(state: &AppState, code: String, user_id: Uuid) -> PageState {
    let csrf_token = state.csrf.issue(user_id).await;
    PageState::Confirm { code, csrf_token }
}

/// `GET /device?code=`
pub async fn device_page(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<DevicePageQuery>,
) -> PageState {
    let Some(code) = query.code.map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()) else {
        return PageState::EnterCode;
    };

    let request = match state.store.find_device_request(&code).await {
        Ok(Some(request)) => request,
        Ok(None) => return PageState::NotFound { code },
        Err(e) => {
            warn!("Device page could not read {}: {}", code, e);
            return PageState::Unavailable;
        }
    };

    match (resolved_state(code, &request), caller.user_id()) {
        (Ok(page), _) => page,
        (Err(code), Some(user_id)) => confirm(&state, code, user_id).await,
        (Err(code), None) => PageState::SignInRequired { code },
    }
}

/// `POST /device/approve`
pub async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Form(form): Form<ApproveForm>,
) -> PageState {
    let code = form.code.trim().to_uppercase();
    if is_cross_site(&headers) {
        warn!("Refused cross-site approval of {}", code);
        return PageState::Forbidden { code };
    }
    let Some(user_id) = caller.user_id() else {
        return PageState::SignInRequired { code };
    };
    if !state.csrf.verify(&form.csrf_token, user_id).await {
        warn!("Refused approval of {} by {}: missing or stale page token", code, user_id);
        return PageState::Forbidden { code };
    }

    match state.auth.approve(&code, user_id).await {
        Ok(_) => {
            info!("✅ Device {} approved by {}", code, user_id);
            PageState::Approved { code }
        }
        Err(DeviceAuthError::NotFound(_)) => PageState::NotFound { code },
        Err(DeviceAuthError::Expired(_)) => PageState::Expired { code },
        Err(DeviceAuthError::AlreadyResolved(request)) => match resolved_state(code, &request) {
            Ok(page) => page,
            Err(code) => confirm(&state, code, user_id).await,
        },
        Err(DeviceAuthError::Store(e)) => {
            warn!("Approving {} failed: {}", code, e);
            PageState::Unavailable
        }
    }
}
