use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use limner_contracts::runs::GenerationManifest;
use limner_contracts::Config;
use limner_engine::{available_providers, convert_tree, Pipeline, RunOptions};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "limner", version, about = "Catalog-driven image generation")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "limner.toml")]
    config: PathBuf,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images for a catalog entity type
    Generate(GenerateArgs),
    /// Regenerate a single entity, optionally with custom description text
    One(OneArgs),
    /// Report manifest counts
    Status(StatusArgs),
    /// Backfill resized copies of existing images
    Convert(ConvertArgs),
    /// List available image providers
    Providers,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    force_regenerate: bool,
}

#[derive(Debug, Parser)]
struct OneArgs {
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    slug: String,
    #[arg(long)]
    custom_text: Option<String>,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long)]
    entity_type: Option<String>,
}

#[derive(Debug, Parser)]
struct ConvertArgs {
    #[arg(long, default_value_t = 128)]
    size: u32,
    #[arg(long)]
    force: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("limner error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Providers => {
            for name in available_providers() {
                println!("{name}");
            }
            Ok(0)
        }
        Command::Generate(args) => run_generate(&load_config(&cli.config)?, args),
        Command::One(args) => run_one(&load_config(&cli.config)?, args),
        Command::Status(args) => run_status(&load_config(&cli.config)?, args),
        Command::Convert(args) => run_convert(&load_config(&cli.config)?, args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    tracing::debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn run_generate(config: &Config, args: GenerateArgs) -> Result<i32> {
    let pipeline = Pipeline::from_config(config, !args.dry_run)?;
    let options = RunOptions {
        limit: args.limit,
        slug: args.slug,
        dry_run: args.dry_run,
        force_regenerate: args.force_regenerate,
    };
    let summary = pipeline.run(&args.entity_type, &options)?;

    println!("Total entities: {}", summary.total);
    println!("Generated: {}", summary.succeeded);
    println!("Skipped (already generated): {}", summary.skipped);
    println!("Failed: {}", summary.failed);
    println!("Estimated cost: ${:.2}", summary.estimated_cost);
    println!("Run log: {}", summary.run_dir.display());
    if args.dry_run {
        println!("Dry run, no images were generated");
    }
    Ok(0)
}

fn run_one(config: &Config, args: OneArgs) -> Result<i32> {
    let pipeline = Pipeline::from_config(config, true)?;
    let artifact = pipeline
        .generate_one(&args.entity_type, &args.slug, args.custom_text.as_deref())
        .with_context(|| format!("failed to generate {}/{}", args.entity_type, args.slug))?;
    println!("Generated {}", artifact.path.display());
    for conversion in &artifact.conversions {
        println!("  conversion {}", conversion.display());
    }
    Ok(0)
}

fn run_status(config: &Config, args: StatusArgs) -> Result<i32> {
    let manifest = GenerationManifest::in_dir(&config.output.base_path);
    let payload = status_payload(&manifest, args.entity_type.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

/// Per-type generated/failed counts, optionally narrowed to one entity type.
fn status_payload(manifest: &GenerationManifest, entity_type: Option<&str>) -> Result<Value> {
    let document = manifest.load()?;
    let mut by_type = Map::new();
    for (name, entries) in &document {
        if entity_type.is_some_and(|wanted| wanted != name) {
            continue;
        }
        let generated = entries.values().filter(|entry| entry.success).count();
        by_type.insert(
            name.clone(),
            json!({"generated": generated, "failed": entries.len() - generated}),
        );
    }
    Ok(json!({
        "manifest": manifest.path().display().to_string(),
        "generated": manifest.count_generated(entity_type)?,
        "entity_types": Value::Object(by_type),
    }))
}

fn run_convert(config: &Config, args: ConvertArgs) -> Result<i32> {
    let base = &config.output.base_path;
    let conversions_root = config.output.conversions.root(base);
    tracing::info!(
        size = args.size,
        source = %base.display(),
        target = %conversions_root.display(),
        "converting images"
    );
    let report = convert_tree(base, &conversions_root, args.size, args.force)?;
    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    Ok(if report.totals.errors == 0 { 0 } else { 1 })
}
