//! `shareport login`

use shareport_core::{
    verification_url, DeviceAuthService, DevicePoller, LoginError, PollConfig, SessionStore,
};
use std::future::Future;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Credentials, CredentialsStore};

/// Process exit code for each way a login can fail
pub fn exit_code(err: &LoginError) -> i32 {
    match err {
        LoginError::Expired(_) => 2,
        LoginError::Timeout { .. } => 3,
        LoginError::Cancelled => 130,
        LoginError::Store(_) | LoginError::Credentials(_) => 1,
    }
}

/// Run the device flow and save the approved identity.
///
/// Cancelling leaves the request on the server to expire by itself.
pub async fn login<C>(
    store: Arc<dyn SessionStore>,
    api_url: &str,
    credentials: &CredentialsStore,
    config: PollConfig,
    open_browser: bool,
    cancel: C,
) -> Result<Credentials, LoginError>
where
    C: Future<Output = ()>,
{
    let poller = DevicePoller::new(DeviceAuthService::new(store), config);
    let request = poller.start().await?;
    let url = verification_url(api_url, &request.device_code);

    println!();
    println!("🔑 Your device code: {}", request.device_code);
    println!("   Approve it at: {}", url);
    println!(
        "   Waiting up to {}s for approval (Ctrl+C to cancel)...",
        poller.config().timeout().as_secs()
    );
    println!();

    if open_browser {
        try_open_browser(&url);
    }

    let grant = poller.poll(&request.device_code, cancel).await?;

    let saved = Credentials::for_user(grant.user_id);
    credentials
        .save(&saved)
        .map_err(|e| LoginError::Credentials(format!("{:#}", e)))?;
    info!(
        "Saved credentials for {} to {:?}",
        grant.user_id,
        credentials.path()
    );

    Ok(saved)
}

/// Best effort; the URL is printed either way
pub fn try_open_browser(url: &str) {
    let mut command = if cfg!(target_os = "macos") {
        let mut command = Command::new("open");
        command.arg(url);
        command
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", "", url]);
        command
    } else {
        let mut command = Command::new("xdg-open");
        command.arg(url);
        command
    };

    match command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => debug!("Opened browser at {}", url),
        Err(e) => debug!("Could not open a browser: {}", e),
    }
}
