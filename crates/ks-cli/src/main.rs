use anyhow::Result;
use clap::{Parser, Subcommand};
use ks_core::ListingKind;
use ks_search::{EngineConfig, SearchService};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ks-cli")]
#[command(about = "KaamSathi listing engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API.
    Serve,
    /// Run one tiered search and print the merged results.
    Search {
        /// courses | jobs
        kind: String,
        query: String,
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Print the featured view for a kind.
    Featured {
        /// courses | jobs
        kind: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let service = SearchService::from_config(&config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            println!("serving listing engine API on port {}", config.web_port);
            ks_web::serve(&config, service).await?;
        }
        Commands::Search {
            kind,
            query,
            max_results,
        } => {
            let kind = parse_kind(&kind)?;
            let listings = service.search(kind, &query, max_results).await?;
            for listing in &listings {
                println!(
                    "{}  [{}] {} ({})",
                    listing.id, listing.provider, listing.title, listing.url
                );
            }
            println!("{} results", listings.len());
        }
        Commands::Featured { kind, limit } => {
            let kind = parse_kind(&kind)?;
            let listings = service.featured(kind, limit).await?;
            for listing in &listings {
                println!(
                    "{:>6.1}  {:>5}  {}",
                    listing.provider_score, listing.popularity_score, listing.title
                );
            }
        }
    }

    Ok(())
}

fn parse_kind(slug: &str) -> Result<ListingKind> {
    ListingKind::parse_slug(slug)
        .ok_or_else(|| anyhow::anyhow!("unknown listing kind '{slug}' (expected courses or jobs)"))
}
