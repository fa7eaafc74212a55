//! shareport - share a local port and show who is sharing what

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shareport_api::{ApiServer, ApiServerConfig};
use shareport_cli::config::{Credentials, CredentialsStore};
use shareport_cli::{login, share, watch};
use shareport_client::{HttpStore, LocaltunnelProvider};
use shareport_core::{
    OpenRequest, PollConfig, Privacy, SessionConfig, SessionScope, SessionStore,
    TunnelSessionManager, ANONYMOUS_USER_ID,
};
use shareport_relay_db::DbStore;

const DEFAULT_API_URL: &str = "http://127.0.0.1:3080";
const DEFAULT_PROVIDER_URL: &str = "https://localtunnel.me";

/// Share a local port through a public tunnel
#[derive(Parser, Debug)]
#[command(name = "shareport")]
#[command(about = "Share a local port through a public tunnel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Local port to share (shorthand for `shareport share --port`)
    #[arg(short, long)]
    port: Option<u16>,

    /// Store API origin
    #[arg(long, env = "SHAREPORT_API_URL", default_value = DEFAULT_API_URL, global = true)]
    api_url: String,

    /// Tunnel provider (localtunnel-compatible)
    #[arg(long, env = "SHAREPORT_PROVIDER_URL", default_value = DEFAULT_PROVIDER_URL, global = true)]
    provider_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign this machine in through the browser
    Login {
        /// Only print the approval URL
        #[arg(long)]
        no_browser: bool,
    },
    /// Forget the saved credentials
    Logout,
    /// Show the signed-in identity
    Whoami,
    /// Share a local port
    Share {
        /// Local port to share
        #[arg(short, long)]
        port: u16,
        /// Keep the session out of the community listing
        #[arg(long)]
        private: bool,
        /// Requested provider subdomain
        #[arg(short, long)]
        subdomain: Option<String>,
        /// Share with a team (slug)
        #[arg(long)]
        team: Option<String>,
    },
    /// Live table of tunnel sessions
    Watch {
        /// Team slug; defaults to your own sessions
        #[arg(long, conflicts_with = "community")]
        team: Option<String>,
        /// Show the public community listing
        #[arg(long)]
        community: bool,
    },
    /// Run the store API server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:3080")]
        bind: SocketAddr,
        /// Database URL (postgres:// or sqlite://)
        #[arg(long, env = "DATABASE_URL", default_value = "sqlite://shareport.db?mode=rwc")]
        database_url: String,
        /// Disable CORS for browser dashboards
        #[arg(long)]
        no_cors: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let command = match (cli.command, cli.port) {
        (Some(command), _) => command,
        (None, Some(port)) => Commands::Share {
            port,
            private: false,
            subdomain: None,
            team: None,
        },
        (None, None) => {
            eprintln!("Nothing to do: pass --port <PORT> or a subcommand (see --help)");
            std::process::exit(2);
        }
    };

    match command {
        Commands::Login { no_browser } => handle_login(&cli.api_url, !no_browser).await,
        Commands::Logout => handle_logout(),
        Commands::Whoami => handle_whoami(&cli.api_url),
        Commands::Share {
            port,
            private,
            subdomain,
            team,
        } => {
            let privacy = if private {
                Privacy::Private
            } else {
                Privacy::Public
            };
            handle_share(
                &cli.api_url,
                &cli.provider_url,
                port,
                privacy,
                subdomain,
                team,
            )
            .await
        }
        Commands::Watch { team, community } => handle_watch(&cli.api_url, team, community).await,
        Commands::Serve {
            bind,
            database_url,
            no_cors,
        } => handle_serve(bind, &database_url, !no_cors).await,
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn credentials() -> Result<(CredentialsStore, Option<Credentials>)> {
    let store = CredentialsStore::default_location()?;
    let saved = store.load()?;
    Ok((store, saved))
}

/// Store handle, authenticated when credentials are saved
fn http_store(api_url: &str, saved: Option<&Credentials>) -> Result<HttpStore> {
    let store = HttpStore::new(api_url).context("Failed to create store client")?;
    Ok(match saved {
        Some(credentials) => store.with_token(credentials.token.clone()),
        None => store,
    })
}

async fn handle_login(api_url: &str, open_browser: bool) -> Result<()> {
    let (credentials, _) = credentials()?;
    let store: Arc<dyn SessionStore> = Arc::new(http_store(api_url, None)?);

    let cancel = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match login::login(
        store,
        api_url,
        &credentials,
        PollConfig::default(),
        open_browser,
        cancel,
    )
    .await
    {
        Ok(saved) => {
            println!("✅ Logged in as {}", saved.user_id);
            Ok(())
        }
        Err(e) => {
            error!("Login failed: {}", e);
            eprintln!("❌ {}", e);
            std::process::exit(login::exit_code(&e));
        }
    }
}

fn handle_logout() -> Result<()> {
    let (credentials, _) = credentials()?;
    if credentials.clear()? {
        println!("Logged out");
    } else {
        println!("Not logged in");
    }
    Ok(())
}

fn handle_whoami(api_url: &str) -> Result<()> {
    let (credentials, saved) = credentials()?;
    match saved {
        Some(saved) => {
            println!("User:   {}", saved.user_id);
            println!("Store:  {}", api_url);
            println!("Config: {}", credentials.path().display());
        }
        None => println!("Not logged in (run `shareport login`)"),
    }
    Ok(())
}

async fn handle_share(
    api_url: &str,
    provider_url: &str,
    port: u16,
    privacy: Privacy,
    subdomain: Option<String>,
    team_slug: Option<String>,
) -> Result<()> {
    let (_, saved) = credentials()?;
    let user_id = match &saved {
        Some(credentials) => credentials.user_id,
        None => {
            info!("Not logged in, sharing anonymously");
            ANONYMOUS_USER_ID
        }
    };
    if team_slug.is_some() && saved.is_none() {
        println!("⚠️  --team needs `shareport login`; sharing as a personal session");
    }

    let store = http_store(api_url, saved.as_ref())?;
    let provider = LocaltunnelProvider::new(provider_url)
        .with_context(|| format!("Invalid provider URL: {}", provider_url))?;
    let manager = TunnelSessionManager::new(
        Arc::new(store),
        Arc::new(provider),
        SessionConfig::default(),
    );

    let request = OpenRequest {
        port,
        privacy,
        subdomain,
        team_slug: team_slug.filter(|_| saved.is_some()),
        user_id,
    };

    share::share(&manager, request, share::shutdown_signal()).await;
    Ok(())
}

async fn handle_watch(api_url: &str, team: Option<String>, community: bool) -> Result<()> {
    let (_, saved) = credentials()?;
    let store = http_store(api_url, saved.as_ref())?;

    let scope = match (team, &saved) {
        _ if community => SessionScope::Community,
        (Some(slug), Some(_)) => {
            let team_id = store
                .resolve_team(&slug)
                .await
                .with_context(|| format!("Failed to look up team '{}'", slug))?
                .with_context(|| format!("Team '{}' not found", slug))?;
            SessionScope::Team(team_id)
        }
        (None, Some(credentials)) => SessionScope::Owner(credentials.user_id),
        (_, None) => {
            println!("Not logged in, showing the community listing");
            SessionScope::Community
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    watch::watch(Arc::new(store), scope, shutdown).await
}

async fn handle_serve(bind: SocketAddr, database_url: &str, enable_cors: bool) -> Result<()> {
    let db = shareport_relay_db::connect(database_url)
        .await
        .with_context(|| format!("Failed to connect to database: {}", database_url))?;
    shareport_relay_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    let config = ApiServerConfig {
        bind_addr: bind,
        enable_cors,
        ..Default::default()
    };
    let server = ApiServer::new(config, DbStore::new(db));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully...");
    };
    server.start(shutdown).await
}
