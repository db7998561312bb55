//! `fieldcrypt` CLI: key generation and encrypt/decrypt runs against a file key vault.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context as _, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Args, Parser, Subcommand};
use fieldcrypt::options::AwsCredentials;
use fieldcrypt::prelude::*;
use fieldcrypt_key_file::{satisfy_key_queries, FileKeyVault};
use secrecy::{SecretString, SecretVec};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldcrypt")]
#[command(about = "Client-side field-level encryption CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    context: ContextArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ContextArgs {
    /// JSON options file; overrides --key-vault-uri
    #[arg(long, env = "FIELDCRYPT_OPTIONS")]
    options: Option<PathBuf>,

    /// Key vault locator (defaults to the vault file)
    #[arg(long, env = "FIELDCRYPT_KEY_VAULT_URI")]
    key_vault_uri: Option<String>,

    /// Local master key, base64 of 32 bytes
    #[arg(long, env = "FIELDCRYPT_LOCAL_MASTER_KEY", hide_env_values = true)]
    local_master_key: Option<String>,

    /// AWS access key id
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    aws_access_key_id: Option<String>,

    /// AWS secret access key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: Option<String>,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// AWS session token
    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    aws_session_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate data keys into a vault file, creating it if needed
    Keygen {
        /// Vault file
        #[arg(long)]
        vault: PathBuf,
        /// Alternate name for the key (repeatable)
        #[arg(long = "alt-name")]
        alt_names: Vec<String>,
        /// Number of keys to generate
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Encrypt the schema-selected fields of a command
    Encrypt {
        /// Vault file
        #[arg(long)]
        vault: PathBuf,
        /// Schema file
        #[arg(long)]
        schema: PathBuf,
        /// Command file
        #[arg(long)]
        command: PathBuf,
    },
    /// Decrypt every encrypted field of a document
    Decrypt {
        /// Vault file
        #[arg(long)]
        vault: PathBuf,
        /// Document file
        #[arg(long)]
        document: PathBuf,
    },
    /// Encrypt, decrypt, and check the result matches the command
    Roundtrip {
        /// Vault file
        #[arg(long)]
        vault: PathBuf,
        /// Schema file
        #[arg(long)]
        schema: PathBuf,
        /// Command file
        #[arg(long)]
        command: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { vault, alt_names, count } => {
            keygen(&cli.context, &vault, &alt_names, count)
        }
        Commands::Encrypt { vault, schema, command } => {
            let (ctx, vault) = open(&cli.context, &vault)?;
            let schema = Schema::from_slice(&read(&schema)?)?;
            let encrypted = encrypt(&ctx, &vault, &schema, &read(&command)?)?;
            print_document(&encrypted)?;
            ctx.teardown();
            Ok(())
        }
        Commands::Decrypt { vault, document } => {
            let (ctx, vault) = open(&cli.context, &vault)?;
            let decrypted = decrypt(&ctx, &vault, &read(&document)?)?;
            print_document(&decrypted)?;
            ctx.teardown();
            Ok(())
        }
        Commands::Roundtrip { vault, schema, command } => {
            let (ctx, vault) = open(&cli.context, &vault)?;
            let schema = Schema::from_slice(&read(&schema)?)?;
            let command: Value = serde_json::from_slice(&read(&command)?)
                .context("command is not valid JSON")?;
            let compact = serde_json::to_vec(&command)?;

            let encrypted = encrypt(&ctx, &vault, &schema, &compact)?;
            println!("encrypted:");
            print_document(&encrypted)?;

            let decrypted = decrypt(&ctx, &vault, &encrypted)?;
            println!("decrypted:");
            print_document(&decrypted)?;

            if decrypted != compact {
                bail!("round trip mismatch: decrypted document differs from the command");
            }
            info!("Round trip matches");
            ctx.teardown();
            Ok(())
        }
    }
}

fn keygen(args: &ContextArgs, path: &Path, alt_names: &[String], count: usize) -> Result<()> {
    if count > 1 && !alt_names.is_empty() {
        bail!("--alt-name can only be used when generating a single key");
    }

    let mut vault = if path.exists() {
        FileKeyVault::open(path)?
    } else {
        FileKeyVault::init(path)?
    };

    let kms = args
        .local_master_key
        .as_deref()
        .map(|encoded| -> Result<LocalKms> {
            let key = STANDARD.decode(encoded).context("local master key is not base64")?;
            Ok(LocalKms::new(SecretVec::new(key))?)
        })
        .transpose()?;

    for _ in 0..count {
        let id = vault.generate_key(alt_names, kms.as_ref())?;
        println!("{id}");
    }
    info!(vault = %path.display(), count, wrapped = kms.is_some(), "Keys generated");
    Ok(())
}

fn open(args: &ContextArgs, vault: &Path) -> Result<(Context, FileKeyVault)> {
    let options = build_options(args, vault)?;
    let ctx = Context::new(options)?;
    let vault = FileKeyVault::open(vault)?;
    Ok((ctx, vault))
}

fn build_options(args: &ContextArgs, vault: &Path) -> Result<Options> {
    let mut options = match &args.options {
        Some(path) => Options::from_slice(&read(path)?)?,
        None => Options::new(
            args.key_vault_uri.clone().unwrap_or_else(|| format!("file://{}", vault.display())),
        ),
    };

    if let Some(key) = &args.local_master_key {
        options = options.with_local_master_key(key.clone());
    }

    match (&args.aws_access_key_id, &args.aws_secret_access_key, &args.aws_region) {
        (Some(access_key_id), Some(secret), Some(region)) => {
            options = options.with_aws_credentials(AwsCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: SecretString::new(secret.clone()),
                region: region.clone(),
                session_token: args.aws_session_token.clone().map(SecretString::new),
            });
        }
        (None, None, _) => {}
        _ => bail!("AWS credentials need an access key id, a secret access key and a region"),
    }

    Ok(options)
}

fn encrypt(
    ctx: &Context,
    vault: &FileKeyVault,
    schema: &Schema,
    command: &[u8],
) -> Result<Vec<u8>> {
    let mut request = ctx.start_encrypt(schema, command)?;
    satisfy_key_queries(vault, &mut request)?;
    Ok(request.finish()?)
}

fn decrypt(ctx: &Context, vault: &FileKeyVault, document: &[u8]) -> Result<Vec<u8>> {
    let mut request = ctx.start_decrypt(document)?;
    satisfy_key_queries(vault, &mut request)?;
    Ok(request.finish()?)
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_document(buffer: &[u8]) -> Result<()> {
    let document: Value = serde_json::from_slice(buffer)?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
