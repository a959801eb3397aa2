use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use todosync_core::config::Config;
use todosync_core::core_crypto::{public_key_to_string, sha256, CryptoProvider};
use todosync_core::core_protocol::RequestOutcome;
use todosync_core::core_sync::adapters::{MemoryRelay, RelayTransport, TodoListEngine};
use todosync_core::core_sync::{Identity, ServerEndpoint, SyncEngine, SyncServices};
use todosync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use todosync_core::metrics::init_metrics;
use tracing::{info, warn};

type DemoEngine = SyncEngine<TodoListEngine, RelayTransport>;

#[derive(Parser, Debug)]
#[command(name = "todosync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a device identity keypair
    Keygen {
        /// RSA modulus size, defaults to crypto.rsa_key_bits
        #[arg(long)]
        bits: Option<usize>,
    },
    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
    /// Show the effective identity and server settings
    Status,
    /// Sync a card list between this identity and a peer through an in-process relay
    Demo {
        /// Email of the second device
        #[arg(long, default_value = "bob@example.com")]
        peer: String,

        /// Cards added by this device
        #[arg(default_values_t = ["milk".to_string(), "bread".to_string()])]
        cards: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = LogLevel::from_str(level).unwrap_or_else(|| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;

    if config.metrics.enabled {
        init_metrics();
    }

    match args.command {
        Command::Keygen { bits } => keygen(bits.unwrap_or(config.crypto.rsa_key_bits))?,
        Command::InitConfig { path } => {
            Config::default().save_to_file(&path)?;
            info!(path = %path.display(), "Wrote default configuration");
        }
        Command::Status => status(&config)?,
        Command::Demo { peer, cards } => demo(&config, &peer, &cards).await?,
    }

    Ok(())
}

fn keygen(bits: usize) -> Result<()> {
    let provider = CryptoProvider::generate(bits)?;
    let keys = serde_json::json!({
        "public_key": provider.public_key_string()?,
        "private_key": provider.private_key_string()?,
    });
    println!("{}", serde_json::to_string_pretty(&keys)?);
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&status_view(config)?)?);
    Ok(())
}

fn status_view(config: &Config) -> Result<serde_json::Value> {
    let server_key = config
        .server_public_key()?
        .map(|key| public_key_to_string(&key).map(|encoded| sha256(&encoded)))
        .transpose()?;

    let view = serde_json::json!({
        "identity": {
            "email": config.identity.email,
            "has_token": !config.identity.token.is_empty(),
        },
        "server": {
            "address": config.server.address,
            "public_key_sha256": server_key,
        },
        "sync": {
            "request_timeout": format!("{:?}", config.sync.request_timeout),
            "wait_forever": config.sync.wait_forever,
            "pending_max_age": format!("{:?}", config.sync.pending_max_age),
        },
    });
    Ok(view)
}

async fn connect(
    relay: &Arc<MemoryRelay>,
    config: &Config,
    email: &str,
    token: &str,
) -> Result<Arc<DemoEngine>> {
    let crypto = Arc::new(CryptoProvider::generate(config.crypto.rsa_key_bits)?);
    let (transport, mut inbox) = relay.connect(email, token, crypto.public_key().clone()).await;

    let engine = Arc::new(SyncEngine::new(
        Identity::new(email, crypto),
        ServerEndpoint {
            address: config.server.address.clone(),
            public_key: relay.public_key().clone(),
        },
        SyncServices::new(&config.sync),
        Arc::new(TodoListEngine::new(email)),
        Arc::new(transport),
    ));

    let receiver = engine.clone();
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            receiver.handle_inbound(envelope).await;
        }
    });

    Ok(engine)
}

/// Poll until `done` holds or the request timeout passes
async fn wait_until<F, Fut>(timeout: Duration, mut done: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !done().await {
        if tokio::time::Instant::now() >= deadline {
            bail!("devices did not converge within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn demo(config: &Config, peer: &str, cards: &[String]) -> Result<()> {
    if peer == config.identity.email {
        bail!("peer must differ from identity.email ({})", peer);
    }

    let relay = MemoryRelay::new(CryptoProvider::generate(config.crypto.rsa_key_bits)?);
    if config.server_public_key()?.is_some_and(|key| &key != relay.public_key()) {
        warn!(server = %config.server.address, "Configured server key ignored, the in-process relay signs with its own key");
    }

    let alice = connect(&relay, config, &config.identity.email, &config.identity.token).await?;
    let bob = connect(&relay, config, peer, &format!("token-{peer}")).await?;

    for engine in [&alice, &bob] {
        if engine.register_public_key().await?.wait().await != (RequestOutcome::Completed { success: true }) {
            warn!(email = %engine.email(), "Public key registration failed");
        }
    }

    let created = alice.create_group("Groceries", &[bob.email()]).await?.wait().await;
    if created != (RequestOutcome::Completed { success: true }) {
        bail!("create_group failed: {:?}", created);
    }

    let timeout = config.sync.request_timeout;
    wait_until(timeout, || {
        let bob = bob.clone();
        async move { bob.groups().document_state("Groceries").await.is_active() }
    })
    .await?;

    for title in cards {
        alice.add_card("Groceries", title).await?;
    }
    let expected = cards.len();
    wait_until(timeout, || card_count_is(bob.clone(), expected)).await?;

    if expected > 0 {
        bob.set_card_completed("Groceries", 0, true).await?;
        wait_until(timeout, || {
            let alice = alice.clone();
            async move {
                let first = alice.cards("Groceries").await.map(|c| c.first().map(|c| c.completed));
                matches!(first, Ok(Some(true)))
            }
        })
        .await?;
    }

    let view = serde_json::json!({
        alice.email(): alice.cards("Groceries").await?,
        bob.email(): bob.cards("Groceries").await?,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn card_count_is(engine: Arc<DemoEngine>, expected: usize) -> bool {
    engine.cards("Groceries").await.map(|c| c.len() == expected).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reports_configured_identity_and_server() {
        let server = CryptoProvider::generate(1024).unwrap();
        let encoded = server.public_key_string().unwrap();

        let mut config = Config::default();
        config.identity.email = "alice@example.com".to_string();
        config.identity.token = "tok-a".to_string();
        config.server.address = "relay.example.com".to_string();
        config.server.public_key = Some(encoded.clone());

        let view = status_view(&config).unwrap();
        assert_eq!(view["identity"]["email"], "alice@example.com");
        assert_eq!(view["identity"]["has_token"], true);
        assert_eq!(view["server"]["address"], "relay.example.com");
        assert_eq!(view["server"]["public_key_sha256"], sha256(&encoded));
    }

    #[test]
    fn test_status_without_server_key() {
        let view = status_view(&Config::default()).unwrap();
        assert!(view["server"]["public_key_sha256"].is_null());
        assert_eq!(view["identity"]["has_token"], false);
    }
}
