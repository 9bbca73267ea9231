//! adrelay CLI - operator tooling for the token and cache layer
//!
//! Resolves tokens against live resources, inspects the effective
//! configuration and clears cached upstream responses.

use adrelay_lib::config::RelayConfig;
use adrelay_lib::probe::GraphProbe;
use adrelay_lib::storage::create_store;
use adrelay_lib::swr::SwrCache;
use adrelay_lib::token_resolver::TokenResolver;
use adrelay_lib::{CandidateToken, ResourceKind};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adrelay")]
#[command(author, version, about = "Token resolution and cache tooling", long_about = None)]
struct Cli {
    /// Cache backend URL (overrides ADRELAY_CACHE_URL)
    #[arg(long, global = true)]
    cache_url: Option<String>,

    /// Graph API base URL (overrides ADRELAY_GRAPH_BASE_URL)
    #[arg(long, global = true)]
    graph_base_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Display version information
    Version,
    /// Display effective configuration and cache mode
    Status,
    /// Find the first working token for a resource
    Resolve {
        /// Resource kind: ad-account or page
        #[arg(long)]
        kind: ResourceKind,
        /// Ad account or page id
        #[arg(long)]
        id: String,
        /// Candidate as name=token, tried in the order given
        #[arg(long = "candidate", required = true)]
        candidates: Vec<String>,
    },
    /// Delete cached keys matching a glob pattern
    Invalidate {
        pattern: String,
    },
}

/// Parse `name=token`; a bare token gets a positional name
fn parse_candidate(raw: &str, index: usize) -> anyhow::Result<CandidateToken> {
    let (name, token) = match raw.split_once('=') {
        Some((name, token)) => (name.trim().to_string(), token.trim()),
        None => (format!("candidate-{}", index + 1), raw.trim()),
    };
    if token.is_empty() {
        bail!("candidate '{}' has an empty token", name);
    }
    Ok(CandidateToken::new(token, name))
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::from_env().context("invalid ADRELAY_* environment")?;
    if let Some(ref url) = cli.cache_url {
        config.cache.url = Some(url.clone());
    }
    if let Some(ref base) = cli.graph_base_url {
        config.graph_base_url = base.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("adrelay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status) => {
            let config = load_config(&cli)?;
            let store = create_store(&config.cache).await;
            println!("Cache mode:      {}", store.mode());
            println!("Fresh TTL:       {}s", config.fresh_ttl_secs);
            println!("Stale TTL:       {}s", config.stale_ttl_secs);
            println!("Token TTL:       {}s", config.token_ttl_secs);
            println!("Probe timeout:   {}s", config.probe_timeout_secs);
            println!("Graph base URL:  {}", config.graph_base_url);
        }
        Some(Commands::Resolve {
            kind,
            ref id,
            ref candidates,
        }) => {
            let config = load_config(&cli)?;
            let candidates = candidates
                .iter()
                .enumerate()
                .map(|(i, raw)| parse_candidate(raw, i))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let store = create_store(&config.cache).await;
            let probe = Arc::new(GraphProbe::new(&config.graph_base_url, config.probe_timeout())?);
            let resolver = TokenResolver::new(store, probe, config.token_ttl());

            let resolution = resolver.resolve_with_attempts(kind, id, &candidates).await?;
            for attempt in &resolution.attempts {
                println!("  {:<30} {:?}", attempt.name, attempt.outcome);
            }
            match resolution.name {
                Some(ref name) => println!("Resolved via {} ({:?})", name, resolution.source),
                None => {
                    println!("No candidate token can access {} {}", kind, id);
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Invalidate { ref pattern }) => {
            let config = load_config(&cli)?;
            let store = create_store(&config.cache).await;
            if !store.is_enabled() {
                println!("Cache disabled, nothing to invalidate");
                return Ok(());
            }
            let removed = SwrCache::new(store).invalidate(pattern).await;
            println!("Removed {} key(s)", removed);
        }
        None => {
            println!("adrelay CLI - use --help for usage information");
        }
    }

    Ok(())
}
