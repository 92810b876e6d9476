//! nimbus: operator CLI over a local encrypted vault
//!
//! Commands:
//!   config show                          - display current configuration
//!   register --user <id>                 - create a user with a wrapped master key
//!   passwd --user <id>                   - change a user's password
//!   upload --user <id> --body <file> ... - ingest a raw multipart/form-data body
//!   download --user <id> --key <k> --out <path>
//!   delete --user <id> <keys...>         - delete a user's blobs and records
//!   cleanup --user <id> <keys...>        - reconcile failed uploads
//!   status --user <id>                   - disk capacity and user usage
//!
//! Passwords are read from NIMBUS_PASSWORD (and NIMBUS_NEW_PASSWORD for
//! passwd) when set, otherwise prompted on the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use nimbus_core::config::NimbusConfig;
use nimbus_core::{BatchOutcome, NimbusError};
use nimbus_multipart::UploadCallbacks;
use nimbus_vault::Vault;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "nimbus",
    version,
    about = "nimbus encrypted file vault",
    long_about = "nimbus: register users, upload multipart bodies, and read back envelope-encrypted files"
)]
struct Cli {
    /// Path to nimbus.toml configuration file
    #[arg(long, short = 'c', env = "NIMBUS_CONFIG", default_value = "/etc/nimbus/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [log].level
    #[arg(long, env = "NIMBUS_LOG")]
    log: Option<String>,

    /// Log format; defaults to [log].format
    #[arg(long, env = "NIMBUS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Create a user: password hash plus a fresh master key wrapped under it
    Register {
        #[arg(long, short = 'u')]
        user: String,
    },

    /// Change a user's password (the master key is re-wrapped, files untouched)
    Passwd {
        #[arg(long, short = 'u')]
        user: String,
    },

    /// Store every file part of a raw multipart/form-data request body
    Upload {
        #[arg(long, short = 'u')]
        user: String,
        /// File holding the request body
        #[arg(long)]
        body: PathBuf,
        /// The request's Content-Type header, including the boundary
        #[arg(long)]
        content_type: String,
        /// Folder id for files whose body carries no folderId field
        #[arg(long)]
        folder: Option<String>,
        /// Store unencrypted (skip unlocking the master key)
        #[arg(long)]
        plain: bool,
    },

    /// Write a stored file to disk, decrypting it when its record says so
    Download {
        #[arg(long, short = 'u')]
        user: String,
        #[arg(long, short = 'k')]
        key: String,
        #[arg(long, short = 'o')]
        out: PathBuf,
    },

    /// Delete a user's blobs and their file records
    Delete {
        #[arg(long, short = 'u')]
        user: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove staged parts, blobs and records of uploads that failed client-side
    Cleanup {
        #[arg(long, short = 'u')]
        user: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show disk capacity and a user's consumption
    Status {
        #[arg(long, short = 'u')]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NimbusConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found (using defaults)");
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::Register { user } => cmd_register(&config, &user).await,
        Commands::Passwd { user } => cmd_passwd(&config, &user).await,
        Commands::Upload {
            user,
            body,
            content_type,
            folder,
            plain,
        } => cmd_upload(&config, &user, &body, &content_type, folder.as_deref(), plain).await,
        Commands::Download { user, key, out } => cmd_download(&config, &user, &key, &out).await,
        Commands::Delete { user, keys } => cmd_delete(&config, &user, &keys).await,
        Commands::Cleanup { user, keys } => cmd_cleanup(&config, &user, &keys).await,
        Commands::Status { user } => cmd_status(&config, &user).await,
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Password input ────────────────────────────────────────────────────────────

fn read_password(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(env_var) {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(pw))
}

/// Prompt twice unless the password comes from the environment.
fn read_new_password(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(env_var) {
        return Ok(SecretString::from(pw));
    }
    let first = rpassword::prompt_password(prompt).context("reading password")?;
    let second = rpassword::prompt_password("Confirm: ").context("reading password")?;
    if first != second {
        anyhow::bail!("passwords do not match");
    }
    if first.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    Ok(SecretString::from(first))
}

async fn unlock(vault: &Vault, user: &str) -> Result<String> {
    let session = uuid::Uuid::new_v4().to_string();
    let password = read_password("NIMBUS_PASSWORD", &format!("Password for {user}: "))?;
    let spinner = make_spinner("unlock");
    spinner.set_message("deriving key...");
    let result = vault.restore_access(&session, user, password).await;
    spinner.finish_and_clear();
    result.map_err(describe)?;
    Ok(session)
}

/// Attach remediation hints to errors an operator can act on.
fn describe(e: NimbusError) -> anyhow::Error {
    match e {
        NimbusError::IncorrectPassword => anyhow::anyhow!("incorrect password"),
        NimbusError::SessionLocked => {
            anyhow::anyhow!("file is encrypted; unlock with the owner's password")
        }
        other => anyhow::Error::new(other),
    }
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `nimbus config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &NimbusConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `nimbus register` / `nimbus passwd` ──────────────────────────────────────

async fn cmd_register(config: &NimbusConfig, user: &str) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let password = read_new_password("NIMBUS_PASSWORD", &format!("New password for {user}: "))?;

    let spinner = make_spinner("register");
    spinner.set_message("hashing password...");
    let result = vault.register(user, password).await;
    spinner.finish_and_clear();
    result.with_context(|| format!("registering {user}"))?;

    println!("registered {user}");
    Ok(())
}

async fn cmd_passwd(config: &NimbusConfig, user: &str) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let old = read_password("NIMBUS_PASSWORD", &format!("Current password for {user}: "))?;
    let new = read_new_password("NIMBUS_NEW_PASSWORD", "New password: ")?;
    if old.expose_secret() == new.expose_secret() {
        anyhow::bail!("new password is the same as the current one");
    }

    vault
        .change_password(user, old, new)
        .await
        .map_err(describe)?;
    println!("password changed for {user}");
    Ok(())
}

// ── `nimbus upload` ──────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &NimbusConfig,
    user: &str,
    body_path: &Path,
    content_type: &str,
    folder: Option<&str>,
    plain: bool,
) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let session = if plain {
        uuid::Uuid::new_v4().to_string()
    } else {
        unlock(&vault, user).await?
    };

    let file = tokio::fs::File::open(body_path)
        .await
        .with_context(|| format!("opening body: {}", body_path.display()))?;
    let body_len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let body = tokio_util::io::ReaderStream::new(file);

    let pb = make_progress_bar(body_len, "upload");
    let completed = Arc::new(AtomicU64::new(0));
    let (pb_start, pb_progress) = (pb.clone(), pb.clone());
    let (done_progress, done_complete) = (completed.clone(), completed.clone());
    let mut callbacks = UploadCallbacks::new()
        .on_file_start(move |_, name| pb_start.set_message(name.to_string()))
        .on_file_progress(move |_, written| {
            pb_progress.set_position(done_progress.load(Ordering::Relaxed) + written)
        })
        .on_file_complete(move |file| {
            done_complete.fetch_add(file.size, Ordering::Relaxed);
        });

    let result = vault
        .upload(&session, user, Some(content_type), Some(body), &mut callbacks)
        .await;
    drop(callbacks);
    vault.lock(&session);
    let mut records = match result {
        Ok(records) => records,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(anyhow::Error::new(e).context(format!("uploading {}", body_path.display())));
        }
    };
    pb.finish_with_message("done");

    if let Some(folder) = folder {
        for record in records.iter_mut().filter(|r| r.folder_id.is_none()) {
            record.folder_id = Some(folder.to_string());
            vault
                .records()
                .insert(record.clone())
                .context("updating file record")?;
        }
    }

    println!();
    println!("Upload complete: {} file(s)", records.len());
    for record in &records {
        println!(
            "  {}  {:>10}  {}  {}",
            record.storage_key,
            fmt_bytes(record.size),
            if record.is_encrypted() { "encrypted" } else { "plain    " },
            record.relative_path.as_deref().unwrap_or(&record.name),
        );
    }
    info!(user, files = records.len(), "upload command finished");
    Ok(())
}

// ── `nimbus download` ────────────────────────────────────────────────────────

async fn cmd_download(config: &NimbusConfig, user: &str, key: &str, out: &Path) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let record = vault
        .records()
        .get(key)?
        .with_context(|| format!("no file record for {key}"))?;
    if record.owner_id != user {
        anyhow::bail!("no file record for {key}");
    }

    let session = if record.is_encrypted() {
        unlock(&vault, user).await?
    } else {
        uuid::Uuid::new_v4().to_string()
    };
    let download = vault.download(&session, user, key).await.map_err(describe);
    vault.lock(&session);
    let mut download = download?;

    let pb = make_progress_bar(record.size, "download");
    pb.set_message(record.name.clone());
    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = download.stream.next().await {
        let chunk = chunk.context("reading blob")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", out.display()))?;
        written += chunk.len() as u64;
        pb.set_position(written);
    }
    file.flush().await?;
    pb.finish_with_message("done");

    println!("{} → {} ({})", key, out.display(), fmt_bytes(written));
    Ok(())
}

// ── `nimbus delete` / `nimbus cleanup` ───────────────────────────────────────

async fn cmd_delete(config: &NimbusConfig, user: &str, keys: &[String]) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let outcome = vault.delete_files(user, keys).await;
    report_batch("deleted", &outcome)
}

async fn cmd_cleanup(config: &NimbusConfig, user: &str, keys: &[String]) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let outcome = vault.cleanup_failed_uploads(user, keys).await;
    report_batch("cleaned", &outcome)
}

fn report_batch(verb: &str, outcome: &BatchOutcome) -> Result<()> {
    println!("{verb}: {}/{}", outcome.succeeded, outcome.total());
    for failure in &outcome.failures {
        println!("  failed  {}: {}", failure.storage_key, failure.reason);
    }
    if !outcome.is_complete() {
        anyhow::bail!("{} item(s) failed", outcome.failures.len());
    }
    Ok(())
}

// ── `nimbus status` ──────────────────────────────────────────────────────────

async fn cmd_status(config: &NimbusConfig, user: &str) -> Result<()> {
    let vault = Vault::open(config).await.context("opening vault")?;
    let status = vault.storage_status(user).context("reading storage status")?;
    let files = vault.records().list_for(user)?;
    let encrypted = files.iter().filter(|r| r.is_encrypted()).count();

    println!("nimbus v{}", env!("CARGO_PKG_VERSION"));
    println!("  root:      {}", config.storage.root.display());
    println!("  total:     {}", fmt_bytes(status.total));
    println!("  free:      {}", fmt_bytes(status.free));
    println!("  used:      {} ({user})", fmt_bytes(status.used));
    println!("  files:     {} ({encrypted} encrypted)", files.len());
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
