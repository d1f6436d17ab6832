//! Strata administrative CLI.
//!
//! Manages users, access keys, and buckets, and drives on-demand garbage
//! collection against a Strata deployment's metadata and blob stores.
//!
//! # Usage
//!
//! ```text
//! strata-admin --config strata.toml user create --username alice --email alice@example.com
//! strata-admin accesskey create --username alice
//! strata-admin bucket list
//! strata-admin gc run --dry-run
//! ```
//!
//! Exits 0 on success and 1 on any error.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strata_blob::FsBlobStore;
use strata_core::StrataConfig;
use strata_core::crypto::{SecretBox, generate_password};
use strata_core::locker::MemoryLocker;
use strata_engine::{BucketService, GarbageCollector, IamService, Principal};
use strata_meta::SqliteMetaStore;
use strata_meta::entities::VersioningState;

/// Length of generated user passwords.
const GENERATED_PASSWORD_LEN: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "strata-admin", about = "Administer a Strata object store", version)]
struct Cli {
    /// Path to the service configuration file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage users.
    #[command(subcommand)]
    User(UserCommand),
    /// Manage access keys.
    #[command(subcommand)]
    Accesskey(AccessKeyCommand),
    /// Manage buckets.
    #[command(subcommand)]
    Bucket(BucketCommand),
    /// Garbage collection.
    #[command(subcommand)]
    Gc(GcCommand),
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Create a user. Generates a password when none is supplied.
    Create {
        /// Login name.
        #[arg(long)]
        username: String,
        /// Email address.
        #[arg(long)]
        email: String,
        /// Password; generated and printed once when omitted.
        #[arg(long)]
        password: Option<String>,
        /// Grant admin rights.
        #[arg(long)]
        admin: bool,
    },
    /// List all users.
    List,
    /// Show one user.
    Get {
        /// Login name.
        username: String,
    },
    /// Delete a user and their access keys.
    Delete {
        /// Login name.
        username: String,
    },
}

#[derive(Debug, Subcommand)]
enum AccessKeyCommand {
    /// Create an access key; the secret is printed exactly once.
    Create {
        /// Owning user.
        #[arg(long)]
        username: String,
        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
    },
    /// List a user's access keys.
    List {
        /// Owning user.
        #[arg(long)]
        username: String,
    },
    /// Deactivate an access key.
    Revoke {
        /// The access key id.
        access_key_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum BucketCommand {
    /// List every bucket.
    List,
    /// Delete an empty bucket.
    Delete {
        /// Bucket name.
        name: String,
    },
    /// Change a bucket's versioning state.
    SetVersioning {
        /// Bucket name.
        name: String,
        /// `enabled` or `suspended`.
        state: String,
    },
}

#[derive(Debug, Subcommand)]
enum GcCommand {
    /// Run one collection pass now.
    Run {
        /// Count what would be deleted without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Report what a pass would collect (always dry-run).
    Status,
}

/// Everything the subcommands need, wired once.
struct Services {
    config: StrataConfig,
    meta: Arc<SqliteMetaStore>,
    iam: IamService,
    buckets: BucketService,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn connect(config_path: Option<&str>) -> Result<Services> {
    let config = match config_path {
        Some(path) => StrataConfig::from_toml_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => StrataConfig::default(),
    }
    .apply_env();

    let meta = Arc::new(
        SqliteMetaStore::connect(
            &config.database.connection_url(),
            config.database.max_connections,
        )
        .await
        .context("opening metadata store")?,
    );

    let secrets = if config.auth.encryption_key.is_empty() {
        None
    } else {
        Some(
            SecretBox::from_base64(&config.auth.encryption_key)
                .context("auth.encryption_key must be base64 of 32 bytes")?,
        )
    };

    let iam = match secrets {
        Some(secrets) => IamService::new(meta.clone(), meta.clone(), secrets),
        // Key-less deployments can still manage users and buckets; access
        // key operations will fail with a clear message.
        None => IamService::new(
            meta.clone(),
            meta.clone(),
            SecretBox::new(&[0u8; 32]).expect("static key length is valid"),
        ),
    };

    let buckets = BucketService::new(meta.clone());

    Ok(Services {
        config,
        meta,
        iam,
        buckets,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let services = connect(cli.config.as_deref()).await?;

    match cli.command {
        Command::User(cmd) => run_user(&services, cmd).await,
        Command::Accesskey(cmd) => run_access_key(&services, cmd).await,
        Command::Bucket(cmd) => run_bucket(&services, cmd).await,
        Command::Gc(cmd) => run_gc(&services, cmd).await,
    }
}

async fn run_user(services: &Services, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Create {
            username,
            email,
            password,
            admin,
        } => {
            let generated = password.is_none();
            let password = password.unwrap_or_else(|| generate_password(GENERATED_PASSWORD_LEN));
            let user = services
                .iam
                .create_user(&username, &email, &password, admin)
                .await?;
            println!("created user {} (id {})", user.username, user.id);
            if generated {
                println!("generated password: {password}");
            }
        }
        UserCommand::List => {
            for user in services.iam.list_users().await? {
                println!(
                    "{}\t{}\t{}\tactive={}\tadmin={}",
                    user.id, user.username, user.email, user.is_active, user.is_admin
                );
            }
        }
        UserCommand::Get { username } => {
            let user = services.iam.get_user_by_username(&username).await?;
            println!("id:       {}", user.id);
            println!("username: {}", user.username);
            println!("email:    {}", user.email);
            println!("active:   {}", user.is_active);
            println!("admin:    {}", user.is_admin);
            println!("created:  {}", user.created_at.to_rfc3339());
        }
        UserCommand::Delete { username } => {
            let user = services.iam.get_user_by_username(&username).await?;
            services.iam.delete_user(user.id).await?;
            println!("deleted user {username}");
        }
    }
    Ok(())
}

async fn run_access_key(services: &Services, cmd: AccessKeyCommand) -> Result<()> {
    match cmd {
        AccessKeyCommand::Create {
            username,
            description,
        } => {
            if services.config.auth.encryption_key.is_empty() {
                bail!("auth.encryption_key must be configured to create access keys");
            }
            let user = services.iam.get_user_by_username(&username).await?;
            let created = services
                .iam
                .create_access_key(user.id, description, None)
                .await?;
            println!("access key id:     {}", created.key.access_key_id);
            println!("secret access key: {}", created.secret_access_key);
            println!("(the secret is shown exactly once; store it now)");
        }
        AccessKeyCommand::List { username } => {
            let user = services.iam.get_user_by_username(&username).await?;
            for key in services.iam.list_access_keys(user.id).await? {
                println!(
                    "{}\t{}\tcreated={}\tlast_used={}",
                    key.access_key_id,
                    key.status.as_str(),
                    key.created_at.to_rfc3339(),
                    key.last_used_at
                        .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339()),
                );
            }
        }
        AccessKeyCommand::Revoke { access_key_id } => {
            services.iam.deactivate_access_key(&access_key_id).await?;
            println!("revoked access key {access_key_id}");
        }
    }
    Ok(())
}

async fn run_bucket(services: &Services, cmd: BucketCommand) -> Result<()> {
    let admin = Principal::system();
    match cmd {
        BucketCommand::List => {
            for bucket in services.buckets.list(&admin).await? {
                println!(
                    "{}\towner={}\tversioning={}\tacl={}\tcreated={}",
                    bucket.name,
                    bucket.owner_id,
                    bucket.versioning.as_str(),
                    bucket.acl.as_str(),
                    bucket.created_at.to_rfc3339(),
                );
            }
        }
        BucketCommand::Delete { name } => {
            services.buckets.delete(&admin, &name).await?;
            println!("deleted bucket {name}");
        }
        BucketCommand::SetVersioning { name, state } => {
            let state = match state.to_ascii_lowercase().as_str() {
                "enabled" => VersioningState::Enabled,
                "suspended" => VersioningState::Suspended,
                other => bail!("unknown versioning state {other:?}; use enabled or suspended"),
            };
            services
                .buckets
                .put_versioning(&admin, &name, state)
                .await?;
            println!("set versioning on {name} to {}", state.as_str());
        }
    }
    Ok(())
}

async fn run_gc(services: &Services, cmd: GcCommand) -> Result<()> {
    let dry_run = match cmd {
        GcCommand::Run { dry_run } => dry_run,
        GcCommand::Status => true,
    };

    let blobs = Arc::new(
        FsBlobStore::new(
            services.config.storage.data_dir.clone(),
            services.config.storage.temp_dir.clone(),
        )
        .await
        .context("opening blob store")?,
    );
    let locker = Arc::new(MemoryLocker::new());

    let mut gc_config = services.config.gc.clone();
    gc_config.dry_run = dry_run;

    let collector = GarbageCollector::new(
        services.meta.clone(),
        services.meta.clone(),
        blobs,
        locker,
        gc_config,
    );

    let report = collector.run_once().await?;
    if report.skipped {
        println!("skipped: another collector holds the lock");
        return Ok(());
    }
    println!("dry_run:          {}", report.dry_run);
    println!("orphans scanned:  {}", report.scanned);
    println!("blobs deleted:    {}", report.deleted);
    println!("failures:         {}", report.failed);
    println!("more remaining:   {}", report.more_remaining);
    println!("uploads aborted:  {}", report.expired_uploads_aborted);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse()).await
}
