use std::path::PathBuf;

use clap::Parser;

mod cli;
mod config;
mod context;
mod embedding;
mod engine;
mod exhibit;
mod fetch;
mod fingerprint;
mod index;
mod resolver;
mod retry;
mod singleflight;
mod storage;
#[cfg(test)]
mod tests;
mod vectors;
mod web;

use config::Config;
use engine::Engine;
use index::SearchFilters;

fn data_dir(args: &cli::Args) -> PathBuf {
    args.data_dir
        .clone()
        .or_else(|| std::env::var("ARCHIVIO_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();

    let config = Config::load_with(&data_dir(&args))?;
    let engine = Engine::bootstrap(config)?;

    match args.command {
        cli::Command::Daemon {} => {
            web::start_daemon(engine);
            Ok(())
        }

        cli::Command::Archive { url, from, to } => run(async move {
            let outcome = engine.archive(&url, from.as_deref(), to.as_deref()).await?;
            if !outcome.created {
                log::info!("URL already archived as exhibit {}", outcome.exhibit.id);
            }
            println!("{}", serde_json::to_string_pretty(&outcome.exhibit)?);
            Ok(())
        }),

        cli::Command::Search {
            query,
            limit,
            domain,
            year_from,
            year_to,
        } => run(async move {
            let filters = SearchFilters {
                domain,
                year_from,
                year_to,
            };
            let response = engine.search(&query, limit, &filters).await?;

            for hit in &response.results {
                println!(
                    "{:.4}  {}  [{}]  {}",
                    hit.score,
                    hit.exhibit.id,
                    hit.exhibit.snapshot_timestamp,
                    hit.exhibit.title
                );
            }
            log::info!(
                "{} results in {}ms",
                response.results.len(),
                response.took_ms
            );
            Ok(())
        }),

        cli::Command::Context { exhibit_id } => run(async move {
            let (record, cached) = engine.generate_context(&exhibit_id).await?;
            if cached {
                log::debug!("context for {exhibit_id} served from cache");
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }),
    }
}

fn run<F>(fut: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(fut)
}
