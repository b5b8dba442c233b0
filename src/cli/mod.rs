//! Command-line interface for the stitcher.
//!
//! Provides commands for requesting stitches, running the deferred
//! pipeline, and inspecting the marker backlog.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::{EntityStitcher, StitchRequest, StitchingStrategy};
use crate::engine::DocumentMerger;
use crate::store::SqliteStitchStore;

/// stitcher - Entity stitching orchestrator
#[derive(Parser, Debug)]
#[command(name = "stitcher")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Request stitching for entity refs and/or ids
    Stitch {
        /// Entity refs to stitch
        #[arg(long = "entity-ref", value_name = "REF")]
        entity_refs: Vec<String>,

        /// Ingestion ids to resolve and stitch
        #[arg(long = "entity-id", value_name = "ID")]
        entity_ids: Vec<String>,
    },

    /// Run the deferred stitching pipeline until interrupted
    Run,

    /// Show the marker backlog
    Status,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Stitch {
                entity_refs,
                entity_ids,
            } => stitch(entity_refs, entity_ids).await,
            Commands::Run => run_pipeline().await,
            Commands::Status => show_status().await,
            Commands::Config => show_config(),
        }
    }
}

/// Build the store, engine, and orchestrator from configuration
fn build_stitcher() -> Result<(Arc<SqliteStitchStore>, EntityStitcher)> {
    let cfg = config::config()?;

    if let Some(parent) = cfg.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
    }

    let store = Arc::new(
        SqliteStitchStore::open(&cfg.database)
            .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?,
    );
    let engine = Arc::new(DocumentMerger::new(store.clone()));
    let strategy = StitchingStrategy::from_mode(cfg.stitching_mode.as_deref());

    let stitcher = EntityStitcher::new(strategy, store.clone(), engine);
    Ok((store, stitcher))
}

/// Request stitching for the given entities
async fn stitch(entity_refs: Vec<String>, entity_ids: Vec<String>) -> Result<()> {
    let request = StitchRequest {
        entity_refs,
        entity_ids,
    };
    if request.is_empty() {
        anyhow::bail!("Nothing to stitch. Pass --entity-ref and/or --entity-id");
    }

    let (_, stitcher) = build_stitcher()?;
    let deferred = stitcher.strategy().is_deferred();

    stitcher.stitch(request).await?;

    if deferred {
        println!("Entities marked for deferred stitching");
    } else {
        let snapshot = stitcher.tracker().snapshot();
        println!(
            "Stitched inline: {} completed, {} failed",
            snapshot.completed, snapshot.failed
        );
    }

    Ok(())
}

/// Run the deferred pipeline until Ctrl+C
async fn run_pipeline() -> Result<()> {
    let (store, stitcher) = build_stitcher()?;

    if !stitcher.strategy().is_deferred() {
        anyhow::bail!("The pipeline requires stitching.mode = deferred");
    }

    stitcher.start().await?;
    println!("Stitch pipeline running. Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    println!("Stopping pipeline...");
    stitcher.stop().await?;

    let snapshot = stitcher.tracker().snapshot();
    let backlog = store.backlog().await?;
    println!(
        "Stopped: {} completed, {} failed, {} markers remaining",
        snapshot.completed,
        snapshot.failed,
        backlog.pending + backlog.leased
    );

    Ok(())
}

/// Show the marker backlog
async fn show_status() -> Result<()> {
    let (store, _) = build_stitcher()?;
    let backlog = store.backlog().await?;

    println!("Pending markers:  {}", backlog.pending);
    println!("Leased markers:   {}", backlog.leased);
    println!("Documents:        {}", backlog.documents);

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", cfg.home.display());
    println!("Database:    {}", cfg.database.display());
    println!(
        "Mode:        {}",
        cfg.stitching_mode.as_deref().unwrap_or("immediate (default)")
    );

    Ok(())
}
