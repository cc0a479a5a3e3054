use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use elasticalert::config::AppConfig;
use elasticalert::dedup::{DedupStore, SqliteDedupStore};
use elasticalert::rules::{loader, DestinationCatalog};

#[derive(Parser)]
#[command(
    name = "elasticalert",
    about = "Leader-elected rule evaluation and alerting daemon for search indices",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (leader election + scheduler + admin API)
    Serve {
        /// Config file (defaults to $ELASTIC_ALERT_CONFIG, then /etc/elastic-alert/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Load every rule and report validation errors
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Inspect the shared silence table
    Silences {
        #[command(subcommand)]
        action: SilenceAction,
    },
}

#[derive(Subcommand)]
enum SilenceAction {
    /// List stored silences
    List {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Delete silences that have expired
    Purge {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = match &cli.command {
        Commands::Serve { config } | Commands::Validate { config } => config.clone(),
        Commands::Silences { action } => match action {
            SilenceAction::List { config } | SilenceAction::Purge { config } => config.clone(),
        },
    };
    let (config, source) = AppConfig::resolve(path.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { .. } => {
            let shown = source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string());
            tracing::info!(config = %shown, "starting elasticalert daemon");
            elasticalert::serve(config, source).await?;
        }
        Commands::Validate { .. } => {
            let catalog = DestinationCatalog::from_config(&config);
            let outcome = loader::load(&config.rules.paths, &catalog);
            for rule in outcome.rules.iter() {
                println!("ok       {:<30} {:<12} {}", rule.name, rule.kind, rule.source.display());
            }
            for name in &outcome.disabled {
                println!("disabled {name}");
            }
            for err in &outcome.errors {
                println!("error    {err}");
            }
            println!(
                "\n{} valid, {} invalid, {} disabled",
                outcome.rules.len(),
                outcome.errors.len(),
                outcome.disabled.len()
            );
            if !outcome.errors.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Silences { action } => {
            let pool = elasticalert::storage::open_pool(&config.storage.path)?;
            let store = SqliteDedupStore::new(pool);
            match action {
                SilenceAction::List { .. } => {
                    let entries = store.list().await?;
                    if entries.is_empty() {
                        println!("No silences stored.");
                    } else {
                        let now = Utc::now();
                        println!(
                            "{:<30} | {:<25} | {:<5} | Fingerprint",
                            "Rule", "Expires", "Live"
                        );
                        println!("{:-<30}-|-{:-<25}-|-{:-<5}-|-{:-<16}", "", "", "", "");
                        for e in entries {
                            println!(
                                "{:<30} | {:<25} | {:<5} | {}",
                                e.rule_name,
                                e.expires_at.to_rfc3339(),
                                e.is_live(now),
                                &e.fingerprint[..e.fingerprint.len().min(16)]
                            );
                        }
                    }
                }
                SilenceAction::Purge { .. } => {
                    let removed = store.purge_expired(Utc::now()).await?;
                    println!("Purged {removed} expired silence(s).");
                }
            }
        }
    }

    Ok(())
}
