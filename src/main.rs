use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use auction_session::auth::{CredentialStore, SqliteKeyValueStore};
use auction_session::config::{CliArgs, Config, LogFormat};
use auction_session::SessionClient;

#[tokio::main]
async fn main() -> Result<()> {
    // .env values count as ENV for clap
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    init_logging(&config);

    tracing::info!("🚀 Auction session client starting...");
    tracing::info!("API base URL: {}", config.api_base_url);

    let storage = SqliteKeyValueStore::open(&config.session_db_file)?;
    tracing::debug!("Session database: {}", storage.path().display());
    let store = CredentialStore::load(Arc::new(storage));

    let client = SessionClient::new(&config, store)?;
    tracing::info!("✅ HTTP client initialized with connection pooling");

    if let Some(token) = args.token.clone() {
        client.complete_login(token).await;
    }

    let mut events = client.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "Session event");
        }
    });

    if client.store().is_authenticated().await {
        match client.fetch_profile(true).await {
            Ok(Some(user)) => tracing::info!(
                "👤 Signed in: {}",
                serde_json::to_string(&user).unwrap_or_default()
            ),
            Ok(None) => tracing::warn!("Profile response carried no user record"),
            Err(e) => tracing::error!("❌ Profile bootstrap failed: {}", e),
        }
    } else {
        tracing::info!("No stored session, requests go out anonymously");
    }

    let fetches = args.get.iter().map(|path| {
        let client = client.clone();
        async move {
            let result = match client.get(path) {
                Ok(request) => client.send(request).await,
                Err(e) => Err(e),
            };
            (path, result)
        }
    });
    for (path, result) in futures::future::join_all(fetches).await {
        match result {
            Ok(response) => tracing::info!("GET {} -> {}", path, response.status),
            Err(e) => tracing::error!("GET {} failed: {}", path, e),
        }
    }

    if args.logout {
        client.logout().await;
    }

    let snapshot = client.metrics().snapshot();
    tracing::info!(
        dispatches = snapshot.total_dispatches,
        refreshes = snapshot.refresh_attempts,
        retries = snapshot.retries,
        "Done"
    );

    printer.abort();
    Ok(())
}

fn init_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
