//! UntitledOne CLI - operator tooling for storage connections.
//!
//! Inspects and maintains per-user provider connections in the credential
//! database, rotates token encryption keys, and drives provider operations
//! for diagnostics. Secrets come from the environment, never from arguments.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use untitledone_common::{ProviderKind, UserId};
use untitledone_credentials::{CredentialStore, KeyRotation};
use untitledone_crypto::{CipherConfig, TokenCipher};
use untitledone_storage::{DownloadTarget, StorageConfig, StorageProviderFactory, UploadFile};

#[derive(Parser)]
#[command(name = "untitledone")]
#[command(about = "UntitledOne - Storage connection management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the credential database.
    #[arg(long, default_value = "./data/credentials.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a user's provider connections.
    Status {
        #[arg(short, long)]
        user: String,
    },

    /// Re-encrypt every stored token under the target key version.
    RotateKeys {
        /// Key version to rotate to (default: the current version).
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Upload a file to a provider.
    Upload {
        #[arg(short, long)]
        user: String,

        /// Provider: local, dropbox or google_drive.
        #[arg(short, long)]
        provider: ProviderKind,

        /// Source file to upload.
        #[arg(short, long)]
        source: PathBuf,

        /// Destination path within the app folder (default: file name).
        #[arg(short, long)]
        dest: Option<String>,

        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },

    /// Print a download location for a file.
    Link {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: ProviderKind,

        #[arg(short, long)]
        file_id: String,

        /// Link lifetime in seconds.
        #[arg(long, default_value_t = 600)]
        ttl: u64,
    },

    /// Delete a file from a provider.
    Delete {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: ProviderKind,

        #[arg(short, long)]
        file_id: String,
    },

    /// Check that a connection still authenticates.
    Validate {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: ProviderKind,
    },

    /// Force a token refresh, whatever the connection's status.
    Refresh {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: ProviderKind,
    },

    /// Remove a stored connection.
    Disconnect {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: ProviderKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Commands::Status { user } => cmd_status(&cli.db, &user).await,

        Commands::RotateKeys { target } => cmd_rotate_keys(&cli.db, target).await,

        Commands::Upload {
            user,
            provider,
            source,
            dest,
            content_type,
        } => cmd_upload(&cli.db, &user, provider, &source, dest, &content_type).await,

        Commands::Link {
            user,
            provider,
            file_id,
            ttl,
        } => cmd_link(&cli.db, &user, provider, &file_id, ttl).await,

        Commands::Delete {
            user,
            provider,
            file_id,
        } => cmd_delete(&cli.db, &user, provider, &file_id).await,

        Commands::Validate { user, provider } => cmd_validate(&cli.db, &user, provider).await,

        Commands::Refresh { user, provider } => cmd_refresh(&cli.db, &user, provider).await,

        Commands::Disconnect { user, provider } => cmd_disconnect(&cli.db, &user, provider).await,
    }
}

fn open_store(db: &Path) -> Result<Arc<CredentialStore>> {
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = CredentialStore::open(db).context("Failed to open credential database")?;
    Ok(Arc::new(store))
}

fn load_cipher() -> Result<Arc<TokenCipher>> {
    let config = CipherConfig::from_env().context("Invalid token encryption configuration")?;
    let cipher = TokenCipher::new(config).context("Failed to initialize token cipher")?;
    Ok(Arc::new(cipher))
}

fn parse_user(user: &str) -> Result<UserId> {
    UserId::new(user).context("Invalid user id")
}

fn build_factory(db: &Path) -> Result<StorageProviderFactory> {
    let config = StorageConfig::from_env().context("Invalid storage configuration")?;
    let factory = StorageProviderFactory::new(config, open_store(db)?, load_cipher()?)
        .context("Failed to initialize storage providers")?;
    Ok(factory)
}

/// Show connection summaries as JSON.
async fn cmd_status(db: &Path, user: &str) -> Result<()> {
    let user_id = parse_user(user)?;
    let store = open_store(db)?;

    let connections = store
        .list_for_user(&user_id)
        .await
        .context("Failed to list connections")?;

    if connections.is_empty() {
        println!("No external storage connected for {}.", user_id);
    } else {
        println!("{}", serde_json::to_string_pretty(&connections)?);
    }

    Ok(())
}

/// Rotate stored tokens to a new key version.
async fn cmd_rotate_keys(db: &Path, target: Option<String>) -> Result<()> {
    let cipher = load_cipher()?;
    let target = target.unwrap_or_else(|| cipher.current_version().to_string());
    info!(key_version = %target, "Rotating token encryption");

    let rotation = KeyRotation::new(open_store(db)?, cipher);
    let report = rotation
        .rotate(&target)
        .await
        .context("Key rotation failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed > 0 {
        anyhow::bail!("{} connection(s) could not be rotated", report.failed);
    }

    Ok(())
}

/// Upload a local file.
async fn cmd_upload(
    db: &Path,
    user: &str,
    provider: ProviderKind,
    source: &Path,
    dest: Option<String>,
    content_type: &str,
) -> Result<()> {
    let user_id = parse_user(user)?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("Source has no file name")?;
    let dest = dest.unwrap_or_else(|| name.clone());

    let data = tokio::fs::read(source)
        .await
        .context("Failed to read source file")?;

    info!("Uploading {} to {} as {}", source.display(), provider, dest);

    let factory = build_factory(db)?;
    let adapter = factory.get(provider, &user_id).await?;
    let result = adapter
        .upload(UploadFile::new(name, content_type, data), &dest, &user_id)
        .await
        .context("Upload failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}

/// Print a URL, or note that content must be proxied.
async fn cmd_link(
    db: &Path,
    user: &str,
    provider: ProviderKind,
    file_id: &str,
    ttl: u64,
) -> Result<()> {
    let user_id = parse_user(user)?;
    let factory = build_factory(db)?;
    let adapter = factory.get(provider, &user_id).await?;

    let target = adapter
        .get_download_url(file_id, &user_id, Duration::from_secs(ttl))
        .await
        .context("Failed to get download location")?;

    match target {
        DownloadTarget::Url { url, expires_at } => {
            println!("{}", url);
            println!("  Expires: {}", expires_at);
        }
        DownloadTarget::Proxied { file_id } => {
            println!("File {} is served through the application.", file_id);
        }
    }

    Ok(())
}

async fn cmd_delete(db: &Path, user: &str, provider: ProviderKind, file_id: &str) -> Result<()> {
    let user_id = parse_user(user)?;
    let factory = build_factory(db)?;
    let adapter = factory.get(provider, &user_id).await?;

    adapter
        .delete(file_id, &user_id)
        .await
        .context("Failed to delete file")?;

    println!("File deleted: {}", file_id);

    Ok(())
}

async fn cmd_validate(db: &Path, user: &str, provider: ProviderKind) -> Result<()> {
    let user_id = parse_user(user)?;
    let factory = build_factory(db)?;
    let adapter = factory.get(provider, &user_id).await?;

    if adapter.validate_connection(&user_id).await? {
        println!("{} connection is valid.", provider);
    } else {
        println!("{} connection needs to be reconnected.", provider);
    }

    Ok(())
}

async fn cmd_refresh(db: &Path, user: &str, provider: ProviderKind) -> Result<()> {
    let user_id = parse_user(user)?;
    let factory = build_factory(db)?;

    if factory.refresh_connection(provider, &user_id).await? {
        println!("{} tokens refreshed.", provider);
    } else {
        anyhow::bail!("{} refresh failed; the user must reconnect", provider);
    }

    Ok(())
}

async fn cmd_disconnect(db: &Path, user: &str, provider: ProviderKind) -> Result<()> {
    let user_id = parse_user(user)?;
    let store = open_store(db)?;

    let removed = store
        .delete_connection(&user_id, provider)
        .await
        .context("Failed to remove connection")?;

    if removed {
        println!("{} disconnected for {}.", provider, user_id);
    } else {
        println!("No {} connection for {}.", provider, user_id);
    }

    Ok(())
}
