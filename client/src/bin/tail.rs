//! livesync-tail - print a live collection as it changes.
//!
//! ```text
//! livesync-tail projects --filter client_id=X --url http://localhost:3000
//! ```

use std::sync::Arc;

use clap::Parser;
use livesync_client::{Filter, HttpSource, SyncConfig, Synchronizer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "livesync-tail", version, about = "Mirror a collection and log every change")]
struct Args {
    /// Collection to mirror
    collection: String,

    /// Restrict to records where FIELD equals VALUE
    #[arg(long, value_name = "FIELD=VALUE")]
    filter: Option<String>,

    /// Server base URL (overrides LIVESYNC_URL)
    #[arg(long)]
    url: Option<Url>,

    /// Print full records instead of ids
    #[arg(long)]
    verbose: bool,
}

fn parse_filter(raw: &str) -> Result<Filter, Box<dyn std::error::Error>> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got {:?}", raw))?;
    Ok(Filter::eq(field, value)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livesync_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(url) = args.url {
        config = config.with_url(url);
    }
    let filter = args.filter.as_deref().map(parse_filter).transpose()?;

    let source = Arc::new(HttpSource::from_config(&config)?);
    let sync = Synchronizer::new(source, config);
    let mut session = sync.open(args.collection, filter)?;

    let snapshot = session.wait_loaded().await?;
    match &snapshot.failure {
        Some(failure) => tracing::error!("{}", failure),
        None => tracing::info!(records = snapshot.len(), "Loaded"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = session.changed() => {
                let snapshot = changed?;
                if args.verbose {
                    for record in &snapshot.records {
                        println!("{}", serde_json::to_string(record)?);
                    }
                }
                tracing::info!(
                    revision = snapshot.revision,
                    feed = ?snapshot.feed,
                    ids = ?snapshot.ids(),
                    "Mirror changed"
                );
                if let Some(failure) = &snapshot.failure {
                    tracing::warn!("{}", failure);
                }
            }
        }
    }

    session.close();
    Ok(())
}
