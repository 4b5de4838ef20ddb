mod signal;

use std::path::PathBuf;

use clap::Parser;

use seqhaul_core::config::UploaderConfig;
use seqhaul_core::controller::{self, RunOutcome};

#[derive(Parser)]
#[command(name = "seqhaul", version,
    about = "Incrementally upload a growing sequencer run as one composed tar.gz",
    after_help = "\
Environment variables:
  CHUNK_SIZE_MB                Snapshot threshold in MiB (default 100)
  DELAY_BETWEEN_INCREMENTS_SEC Poll interval (default 600)
  RUN_COMPLETION_TIMEOUT_DAYS  Staleness/timeout bound (default 16)
  STAGING_AREA_PATH            Staging root override
  RSYNC_RETRY_MAX_ATTEMPTS     Upload retry bound (default 12)
  RSYNC_RETRY_DELAY_SEC        Base retry delay, scales linearly (default 600)
  TERRA_RUN_TABLE_NAME         Table name for the import TSV (default flowcell)
  TAR_EXCLUSIONS               Space-separated static exclusion override
  SOURCE_PATH_IS_ON_NFS        Disable device comparison (default true)
  CRON_INVOKED                 Mark the run as non-interactive
  GCS_BEARER_TOKEN             Bearer token for gs:// destinations")]
struct Cli {
    /// Run directory produced by the instrument
    source_path: PathBuf,

    /// Destination prefix (gs://bucket/prefix or a local path)
    destination_prefix: String,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    signal::install_signal_handlers();

    let config = config_from_env();
    match controller::run(
        &config,
        &cli.source_path,
        &cli.destination_prefix,
        &signal::SHUTDOWN,
    ) {
        Ok(RunOutcome::AlreadyUploaded) => {
            println!("Already uploaded: nothing to do.");
        }
        Ok(RunOutcome::AnotherInstanceActive { pid }) => {
            println!("Another uploader (pid {pid}) owns this run; exiting.");
        }
        Ok(RunOutcome::Completed(stats)) => {
            println!(
                "Upload complete: {} increments, {} compose calls, {} source bytes",
                stats.increments, stats.compose_calls, stats.total_source_bytes,
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

/// Translate the documented environment variables into the config
/// structure. Only this launcher reads the environment; the library gets
/// explicit values.
fn config_from_env() -> UploaderConfig {
    let mut config = UploaderConfig::default();

    if let Some(v) = env_parse("CHUNK_SIZE_MB") {
        config.chunk_size_mb = v;
    }
    if let Some(v) = env_parse("DELAY_BETWEEN_INCREMENTS_SEC") {
        config.delay_between_increments_sec = v;
    }
    if let Some(v) = env_parse("RUN_COMPLETION_TIMEOUT_DAYS") {
        config.run_completion_timeout_days = v;
    }
    if let Some(v) = std::env::var_os("STAGING_AREA_PATH") {
        if !v.is_empty() {
            config.staging_root = Some(PathBuf::from(v));
        }
    }
    if let Some(v) = env_parse("RSYNC_RETRY_MAX_ATTEMPTS") {
        config.retry_max_attempts = v;
    }
    if let Some(v) = env_parse("RSYNC_RETRY_DELAY_SEC") {
        config.retry_delay_sec = v;
    }
    if let Ok(v) = std::env::var("TERRA_RUN_TABLE_NAME") {
        if !v.is_empty() {
            config.terra_table = v;
        }
    }
    if let Ok(v) = std::env::var("TAR_EXCLUSIONS") {
        let patterns: Vec<String> = v.split_whitespace().map(str::to_string).collect();
        if !patterns.is_empty() {
            config.static_exclusions = patterns;
        }
    }
    if let Ok(v) = std::env::var("SOURCE_PATH_IS_ON_NFS") {
        config.source_is_nfs = truthy(&v);
    }
    config.cron_invoked = match std::env::var("CRON_INVOKED") {
        Ok(v) => truthy(&v),
        Err(_) => !stdout_is_tty(),
    };
    if let Ok(v) = std::env::var("GCS_BEARER_TOKEN") {
        if !v.is_empty() {
            config.gcs_bearer_token = Some(v);
        }
    }

    config
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("Warning: ignoring unparsable {name}={raw}");
            None
        }
    }
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn stdout_is_tty() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
    }

    #[cfg(not(unix))]
    {
        true
    }
}
