use std::{sync::Arc, time::Duration};

use clap::Parser;
use reqwest_middleware::ClientBuilder;
use tokio::time;
use tollgate::{
    gateway::{Credentials, HttpAuthGateway},
    navigator::Navigator,
    storage::FileStorage,
    AuthConfig, AuthContext, Password, Role,
};
use tollgate_reqwest::{auth_error, ExactHostMatch, SessionMiddleware};
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// Base URL of the authorization server
    #[clap(short, long, env = "AUTH_BASE_URL")]
    base_url: Url,

    /// The account email
    #[clap(short, long, env = "AUTH_EMAIL")]
    email: String,

    /// The account password
    #[clap(short, long, env = "AUTH_PASSWORD", hide_env_values = true)]
    password: Password,

    /// The role to sign in as
    #[clap(short, long, env = "AUTH_ROLE", default_value = "teacher", value_parser = parse_role)]
    role: Role,

    /// A protected resource to poll through the session middleware
    #[clap(short = 'u', long, env = "POLL_URL")]
    poll_url: Url,

    /// Seconds between polls
    #[clap(short, long, env = "POLL_INTERVAL", default_value_t = 30)]
    interval: u64,

    /// The local file used to persist the session
    #[clap(short = 'f', long, env = "SESSION_FILE", default_value = ".session.json")]
    session_file: std::path::PathBuf,
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s {
        "teacher" => Ok(Role::Teacher),
        "parent" => Ok(Role::Parent),
        "school" => Ok(Role::School),
        "admin" => Ok(Role::Admin),
        other => Err(format!("unknown role `{other}`")),
    }
}

/// Stands in for a browser: logs where the user would be sent
#[derive(Debug)]
struct LogNavigator;

impl Navigator for LogNavigator {
    fn current_path(&self) -> Option<String> {
        Some("/poll".into())
    }

    fn navigate(&self, location: &str) {
        tracing::warn!(location, "session ended, user would be sent to sign in");
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = AuthConfig::new(opts.base_url);
    let gateway = HttpAuthGateway::from_config(&config)?;
    let context = AuthContext::start(
        &config,
        Arc::new(gateway),
        FileStorage::new(opts.session_file),
        Arc::new(LogNavigator),
    )
    .await;

    let status = context.session().check_status().await;
    if !status.authenticated {
        let user = context
            .session()
            .login(&Credentials {
                email: opts.email,
                password: opts.password,
                role: opts.role,
            })
            .await?;
        tracing::info!(user.id = %user.id, role = user.role.as_str(), "signed in");
    }

    let host = opts.poll_url.host_str().unwrap_or_default().to_owned();
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(
            SessionMiddleware::new(context.coordinator().clone())
                .with_predicate(ExactHostMatch::new(host)),
        )
        .build();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match client.get(opts.poll_url.clone()).send().await {
            Ok(response) => {
                tracing::info!(status = response.status().as_u16(), "polled resource");
            }
            Err(error) => match auth_error(&error) {
                Some(error) if error.is_terminal() => {
                    tracing::error!(%error, "session ended, stopping");
                    return Ok(());
                }
                Some(error) => tracing::warn!(%error, "poll failed"),
                None => tracing::warn!(%error, "poll failed"),
            },
        }

        if let Some(session) = context.store().current() {
            tracing::debug!(
                expires_at = session.expires_at().map(|t| t.0),
                renewal_at = context.monitor().scheduled_at().map(|t| t.0),
                "session state"
            );
        }
    }
}
