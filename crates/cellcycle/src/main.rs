use std::path::PathBuf;

use anyhow::{Context, Result};
use cellcycle_core::{
    batch::structure_file, process_file_list_from_json, write_binary, ProcessedCyclerRun,
    ProcessingContext, StructuringConfig, STRUCTURE_DTYPES,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Battery cycler data structuring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Structure every valid file of a `{file_list, run_list, validity}` document
    Structure(StructureArgs),
    /// Structure a single cycler file
    File(FileArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// TOML file overriding structuring defaults
    #[arg(long)]
    config: Option<PathBuf>,
    /// Processing root; defaults to $CELLCYCLE_PROCESSING_DIR
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StructureArgs {
    /// JSON document, or path to a file containing one
    input: String,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct FileArgs {
    path: PathBuf,
    /// Write the compact binary archive to this path instead of the JSON document
    #[arg(long)]
    binary: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

impl CommonArgs {
    fn context(&self) -> Result<ProcessingContext> {
        let config = match &self.config {
            Some(path) => StructuringConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => StructuringConfig::default(),
        };
        Ok(match &self.root {
            Some(root) => ProcessingContext::new(root, config),
            None => ProcessingContext::from_env(config),
        })
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Structure(args) => {
            let ctx = args.common.context()?;
            let outcome = process_file_list_from_json(&args.input, &ctx)
                .context("failed to process file list")?;
            info!(
                structured = outcome.response.file_list.len(),
                invalid = outcome.response.invalid_file_list.len(),
                "batch finished"
            );
            println!("{}", serde_json::to_string(&outcome.response)?);
            Ok(())
        }
        Command::File(args) => {
            let ctx = args.common.context()?;
            match args.binary {
                Some(output) => {
                    let lookup = ctx.parameter_lookup();
                    let run = ProcessedCyclerRun::auto_load(
                        &args.path,
                        &lookup,
                        &ctx.config,
                        &STRUCTURE_DTYPES,
                    )
                    .with_context(|| format!("failed to structure {}", args.path.display()))?;
                    write_binary(&run, &output, &STRUCTURE_DTYPES)
                        .with_context(|| format!("failed to write {}", output.display()))?;
                    println!("{}", output.display());
                }
                None => {
                    let output = structure_file(&args.path, &ctx)
                        .with_context(|| format!("failed to structure {}", args.path.display()))?;
                    println!("{}", output.display());
                }
            }
            Ok(())
        }
    }
}
