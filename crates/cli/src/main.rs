use std::path::PathBuf;

use arcana_pak::cache::{build_stream_cache, CACHE_FILE_NAME};
use arcana_pak_cli::{build_pak, inspect_pak};
use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic};

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Builds pak and its streaming files from a manifest.
    Build {
        /// Path to the manifest file or to the directory containing `Pak.toml`.
        #[arg(value_name = "manifest", default_value = ".")]
        manifest: PathBuf,
    },
    /// Indexes payloads of previously built streaming files.
    Cache {
        /// Directory scanned recursively for `.starpak` files.
        #[arg(value_name = "dir")]
        dir: PathBuf,

        /// Output cache file.
        /// Defaults to `streaming.starpak_cache` inside the scanned directory.
        #[arg(long = "out", value_name = "path")]
        out: Option<PathBuf>,
    },
    /// Prints tables of a built pak.
    Inspect {
        #[arg(value_name = "pak")]
        pak: PathBuf,
    },
}

#[derive(Debug, Parser)]
#[command(name = "arcpak")]
#[command(about = "Asset container builder")]
#[command(rename_all = "kebab-case")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn main() -> miette::Result<()> {
    install_tracing_subscriber();

    let cli = Cli::parse();

    match cli.command {
        Command::Build { manifest } => {
            let summary = build_pak(&manifest)?;
            println!(
                "Built '{}': {} assets, {} segments, {} payloads streamed, {} reused",
                summary.path.display(),
                summary.header.asset_count,
                summary.header.segment_count,
                summary.streamed,
                summary.reused,
            );
        }
        Command::Cache { dir, out } => {
            let out = out.unwrap_or_else(|| dir.join(CACHE_FILE_NAME));
            let cache = build_stream_cache(&dir)
                .into_diagnostic()
                .wrap_err("Failed to scan streaming files")?;
            cache
                .save(&out)
                .into_diagnostic()
                .wrap_err("Failed to save stream cache")?;
            println!(
                "Cached {} payloads to '{}'",
                cache.entries().len(),
                out.display()
            );
        }
        Command::Inspect { pak } => {
            print!("{}", inspect_pak(&pak)?);
        }
    }

    Ok(())
}

fn install_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt as _;
    if let Err(err) = tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    ) {
        panic!("Failed to install tracing subscriber: {}", err);
    }
}
