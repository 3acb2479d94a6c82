use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use satchel_api::{BagInfo, StorageOptions};
use satchel_engine::{Orchestrator, SatchelConfig, SatchelError};
use satchel_storage_file::FileStorage;

#[derive(Parser)]
#[command(name = "satchel", about = "Inspect and reindex recorded bags")]
struct Cli {
    /// Optional TOML configuration; its [storage] section supplies defaults.
    #[arg(long, env = "SATCHEL_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the metadata of a bag.
    Info {
        /// Bag directory.
        uri: String,
        /// Print raw JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Rebuild metadata.json by scanning the bag's data files.
    Reindex {
        /// Bag directory.
        uri: String,
        /// Write metadata.json here instead of into the bag.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        compression_format: Option<String>,
        /// none, file or message.
        #[arg(long)]
        compression_mode: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Satchel(#[from] SatchelError),

    #[error("failed to render metadata: {0}")]
    Render(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path, "loading configuration");
            SatchelConfig::load(path)?
        }
        None => SatchelConfig::default(),
    };

    let orchestrator = Orchestrator::for_storage(Arc::new(FileStorage::new()));

    match cli.command {
        Command::Info { uri, json } => {
            let info = orchestrator.bag_info(&uri)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
        }
        Command::Reindex {
            uri,
            output_dir,
            compression_format,
            compression_mode,
        } => {
            let mut options = config.storage.unwrap_or_else(|| StorageOptions::new(uri.clone()));
            options.uri = uri;
            if output_dir.is_some() {
                options.metadata_dir = output_dir;
            }
            if let Some(format) = compression_format {
                options.compression_format = format;
            }
            if let Some(mode) = compression_mode {
                options.compression_mode = mode;
            }
            let info = orchestrator.reindex(&options)?;
            println!(
                "reindexed {}: {} messages on {} channels",
                info.uri,
                info.message_count,
                info.channels.len()
            );
        }
    }
    Ok(())
}

fn print_info(info: &BagInfo) {
    let seconds = |ns: i64| ns as f64 / 1e9;
    println!("Files:            {}", info.relative_file_paths.join(", "));
    println!("Storage id:       {}", info.storage_identifier);
    println!("Duration:         {:.3}s", seconds(info.duration_ns));
    println!("Start:            {:.3}s", seconds(info.starting_time_ns));
    println!("End:              {:.3}s", seconds(info.starting_time_ns + info.duration_ns));
    println!("Messages:         {}", info.message_count);
    if !info.compression_format.is_empty() {
        println!("Compression:      {} ({})", info.compression_format, info.compression_mode);
    }
    println!("Channels:");
    for channel in &info.channels {
        println!(
            "  {} | type: {} | count: {} | format: {}",
            channel.channel.name,
            channel.channel.type_name,
            channel.message_count,
            channel.channel.serialization_format
        );
    }
}
