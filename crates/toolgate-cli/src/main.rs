//! toolgate - ledger tooling for the guarded-call authorization boundary.
//!
//! Offline commands over a JSONL evidence ledger: chain verification,
//! export/filter/search, receipt extraction, and signing-key generation.
//! Environment switches (`TOOLGATE_LEDGER_PATH`, `TOOLGATE_PUBLIC_KEY`)
//! are resolved here, at the outer boundary; the library never reads the
//! environment.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::export::OutputFormat;

/// Ledger path override consumed when no positional path is given.
const ENV_LEDGER_PATH: &str = "TOOLGATE_LEDGER_PATH";

/// Default verification key consumed when `--public-key` is absent.
const ENV_PUBLIC_KEY: &str = "TOOLGATE_PUBLIC_KEY";

/// toolgate - tamper-evident decision ledger tooling
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the hash chain (and signatures, with a public key)
    Verify {
        /// Path to the ledger JSONL file
        ledger_path: Option<PathBuf>,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Path to an Ed25519 public key PEM
        #[arg(long)]
        public_key: Option<PathBuf>,
    },

    /// Export ledger entries
    Export {
        /// Path to the ledger JSONL file
        ledger_path: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Ndjson)]
        format: OutputFormat,

        /// Output file path (stdout when absent)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Filter ledger entries by identity and time range
    Filter {
        /// Path to the ledger JSONL file
        ledger_path: Option<PathBuf>,

        /// Keep entries with this request_id
        #[arg(long)]
        request_id: Option<String>,

        /// Keep entries with this action
        #[arg(long)]
        action: Option<String>,

        /// Keep entries with this agent_id
        #[arg(long)]
        agent_id: Option<String>,

        /// Keep entries at or after this UTC timestamp
        #[arg(long)]
        start: Option<String>,

        /// Keep entries at or before this UTC timestamp
        #[arg(long)]
        end: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Ndjson)]
        format: OutputFormat,

        /// Output file path (stdout when absent)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Search request_id/action/agent_id for a substring
    Search {
        /// Path to the ledger JSONL file
        ledger_path: Option<PathBuf>,

        /// Case-insensitive query
        #[arg(long)]
        query: String,

        /// Keep entries at or after this UTC timestamp
        #[arg(long)]
        start: Option<String>,

        /// Keep entries at or before this UTC timestamp
        #[arg(long)]
        end: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Ndjson)]
        format: OutputFormat,

        /// Output file path (stdout when absent)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Extract a signed receipt for one decision
    Receipt {
        /// Path to the ledger JSONL file
        ledger_path: Option<PathBuf>,

        /// Look up by request_id
        #[arg(long)]
        request_id: Option<String>,

        /// Look up by decision_hash
        #[arg(long)]
        decision_hash: Option<String>,

        /// Output file path (stdout when absent)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Generate an Ed25519 signing key pair
    Keygen {
        /// Path for the PKCS#8 private key PEM
        #[arg(long)]
        private_key: PathBuf,

        /// Path for the SPKI public key PEM
        #[arg(long)]
        public_key: PathBuf,

        /// Overwrite existing key files
        #[arg(long)]
        overwrite: bool,
    },
}

fn resolve_ledger_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.or_else(|| std::env::var_os(ENV_LEDGER_PATH).map(PathBuf::from))
}

fn resolve_public_key(path: Option<PathBuf>) -> Option<PathBuf> {
    path.or_else(|| std::env::var_os(ENV_PUBLIC_KEY).map(PathBuf::from))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match cli.command {
        Commands::Verify {
            ledger_path,
            json,
            public_key,
        } => commands::verify::run(
            resolve_ledger_path(ledger_path),
            json,
            resolve_public_key(public_key),
        ),
        Commands::Export {
            ledger_path,
            format,
            output,
        } => commands::export::run_export(resolve_ledger_path(ledger_path), format, output),
        Commands::Filter {
            ledger_path,
            request_id,
            action,
            agent_id,
            start,
            end,
            format,
            output,
        } => commands::export::run_filter(
            resolve_ledger_path(ledger_path),
            commands::export::Filters {
                request_id,
                action,
                agent_id,
                start,
                end,
            },
            format,
            output,
        ),
        Commands::Search {
            ledger_path,
            query,
            start,
            end,
            format,
            output,
        } => commands::export::run_search(
            resolve_ledger_path(ledger_path),
            &query,
            start,
            end,
            format,
            output,
        ),
        Commands::Receipt {
            ledger_path,
            request_id,
            decision_hash,
            output,
        } => commands::receipt::run(
            resolve_ledger_path(ledger_path),
            request_id,
            decision_hash,
            output,
        ),
        Commands::Keygen {
            private_key,
            public_key,
            overwrite,
        } => commands::keygen::run(&private_key, &public_key, overwrite),
    };

    match code {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}
