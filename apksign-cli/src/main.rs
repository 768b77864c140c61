//! Thin command-line harness over `apksign-core`, for exercising the signer
//! without embedding it in a larger patching tool.

use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result};
use apksign_core::PrePatchHash;
use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser)]
#[command(version, long_about = None)]
#[command(arg_required_else_help = true)]
#[command(about = "Signs APKs with the JAR v1 and APK v2 signature schemes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Signs the given APK in place, using a PEM certificate/key file.
    Sign {
        apk_path: PathBuf,
        /// Path to a PEM file containing one CERTIFICATE and one RSA private key.
        #[arg(short, long)]
        pem: PathBuf,
        /// Path to a JSON file of previously-collected pre-patch hashes to reuse.
        #[arg(short, long)]
        known_hashes: Option<PathBuf>,
    },
    /// Signs the given APK in place with a freshly generated, process-cached
    /// debug certificate.
    SignDebug {
        apk_path: PathBuf,
        #[arg(short, long)]
        known_hashes: Option<PathBuf>,
    },
    /// Collects a pre-patch hash cache from an already-signed APK and writes
    /// it as JSON, so a later `sign`/`sign-debug` call can skip re-hashing
    /// unchanged entries.
    CollectHashes {
        apk_path: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Generates a fresh self-signed RSA-2048 certificate/key pair and
    /// writes it to a PEM file.
    GenCert { out: PathBuf },
}

fn load_known_hashes(path: Option<&PathBuf>) -> Result<Option<HashMap<String, PrePatchHash>>> {
    match path {
        None => Ok(None),
        Some(path) => {
            let file = std::fs::File::open(path).context("Opening known-hashes file")?;
            let hashes = serde_json::from_reader(file).context("Parsing known-hashes JSON")?;
            Ok(Some(hashes))
        }
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sign {
            apk_path,
            pem,
            known_hashes,
        } => {
            let pem_text = std::fs::read_to_string(&pem).context("Reading PEM file")?;
            let hashes = load_known_hashes(known_hashes.as_ref())?;

            info!("Signing {}", apk_path.display());
            apksign_core::sign_apk(&apk_path, &pem_text, hashes.as_ref())
                .context("Signing APK")?;
            info!("Done");
        }
        Commands::SignDebug {
            apk_path,
            known_hashes,
        } => {
            let hashes = load_known_hashes(known_hashes.as_ref())?;

            info!("Signing {} with a debug certificate", apk_path.display());
            apksign_core::sign_apk_with_builtin_cert(&apk_path, hashes.as_ref())
                .context("Signing APK")?;
            info!("Done");
        }
        Commands::CollectHashes { apk_path, out } => {
            let hashes = apksign_core::collect_pre_patch_hashes(&apk_path)
                .context("Archive had no manifest, or an unsupported one")?;

            let writer = std::fs::File::create(&out).context("Creating output file")?;
            serde_json::to_writer_pretty(writer, &hashes).context("Writing hash cache JSON")?;
            info!("Wrote {} entry hashes to {}", hashes.len(), out.display());
        }
        Commands::GenCert { out } => {
            let pem = apksign_core::generate_new_certificate_pem()
                .context("Generating certificate")?;
            std::fs::write(&out, pem).context("Writing PEM file")?;
            info!("Wrote new certificate to {}", out.display());
        }
    }

    Ok(())
}
