use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use sessionkey_agent::pem::load_key_file;
use sessionkey_agent::{KeyStore, MemoryAgentConnector, SshAgentConnector};
use sessionkey_core::config::{Config, DirectoryConfig};
use sessionkey_core::{
    AgentConnector, CredentialSource, Identity, KeyDirectory, KeyMatcher, SessionCredential,
};
use sessionkey_directory::{FileDirectory, HttpDirectory};
use ssh_key::HashAlg;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config_path, args) = split_config_flag(std::env::args().skip(1).collect())?;
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "acquire" => cmd_acquire(&config_path, &args[1..]).await,
        "match" => cmd_match(&config_path, &args[1..]).await,
        "verify" => cmd_verify(&config_path, &args[1..]).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
sessionkey - signed session credentials from your SSH agent

USAGE:
    sessionkey [--config <path>] <command> [args...]

COMMANDS:
    acquire <user>                      Print a session credential as JSON
                                        (UNAUTHENTICATED if no key matches)
    match <user>                        Show which agent key the directory trusts
    verify <user> <file|->              Check a credential against the user's
                                        directory keys
    help                                Show this help

OPTIONS:
    -c, --config <path>                 Config file
                                        (default: $XDG_CONFIG_HOME/sessionkey/config.toml)

ENVIRONMENT:
    SSH_AUTH_SOCK                       Agent socket, unless [agent] socket is set
    RUST_LOG                            Log filter (default: warn)"
    );
}

/// Pull `--config`/`-c` out of the argument list, wherever it appears.
fn split_config_flag(args: Vec<String>) -> Result<(PathBuf, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let Some(path) = iter.next() else {
                bail!("{arg} requires a path argument");
            };
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((config.unwrap_or_else(default_config_path), rest))
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("sessionkey").join("config.toml")
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o022 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "config file is writable by group or others; it controls which keys are trusted"
                    );
                }
            }
            Err(e) => {
                tracing::warn!("could not check config file permissions: {e}");
            }
        }
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

fn build_directory(config: &Config, config_path: &Path) -> Result<Arc<dyn KeyDirectory>> {
    Ok(match &config.directory {
        DirectoryConfig::File { path } => {
            let root = path.clone().unwrap_or_else(|| {
                config_path
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join("keys")
            });
            tracing::debug!(root = %root.display(), "using file key directory");
            Arc::new(FileDirectory::new(root))
        }
        DirectoryConfig::Http { url, timeout_secs } => {
            tracing::debug!(url = %url, "using HTTP key directory");
            Arc::new(HttpDirectory::new(url, Duration::from_secs(*timeout_secs))?)
        }
    })
}

async fn build_agent(config: &Config) -> Result<Arc<dyn AgentConnector>> {
    if config.agent.key_files.is_empty() {
        return Ok(Arc::new(SshAgentConnector::from_config(&config.agent)));
    }

    let mut store = KeyStore::default();
    for path in &config.agent.key_files {
        let added = load_key_file(&mut store, path).await?;
        tracing::debug!(path = %path.display(), added, "loaded key file");
    }
    Ok(Arc::new(MemoryAgentConnector::new(Arc::new(RwLock::new(store)))))
}

async fn build_source(config_path: &Path) -> Result<CredentialSource> {
    let config = load_config(config_path)?;
    Ok(CredentialSource::new(
        build_directory(&config, config_path)?,
        build_agent(&config).await?,
        KeyMatcher::from_config(&config.matching),
    ))
}

fn identity_arg(args: &[String], usage: &str) -> Result<Identity> {
    let Some(name) = args.first() else {
        bail!("usage: {usage}");
    };
    Ok(Identity::new(name.as_str())?)
}

async fn cmd_acquire(config_path: &Path, args: &[String]) -> Result<()> {
    let identity = identity_arg(args, "sessionkey acquire <user>")?;
    let source = build_source(config_path).await?;
    let credential = source.acquire_session_credential(&identity).await;
    println!("{}", serde_json::to_string(&credential)?);
    Ok(())
}

async fn cmd_match(config_path: &Path, args: &[String]) -> Result<()> {
    let identity = identity_arg(args, "sessionkey match <user>")?;
    let source = build_source(config_path).await?;
    let key = source.find_matching_key(&identity).await?;
    println!("{}\t{}", key.fingerprint(), key.comment());
    Ok(())
}

async fn cmd_verify(config_path: &Path, args: &[String]) -> Result<()> {
    const USAGE: &str = "sessionkey verify <user> <file|->";
    let identity = identity_arg(args, USAGE)?;
    let Some(input) = args.get(1) else {
        bail!("usage: {USAGE}");
    };

    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read credential from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("read credential {input}"))?
    };
    let credential: SessionCredential =
        serde_json::from_str(&text).context("parse credential JSON")?;

    if credential.owner() != &identity {
        bail!(
            "credential belongs to {}, not {identity}",
            credential.owner()
        );
    }
    if !credential.is_authenticated() {
        bail!("credential for {identity} is UNAUTHENTICATED");
    }

    let source = build_source(config_path).await?;
    let trusted = source
        .matcher()
        .trusted_keys(source.directory(), &identity)
        .await?;
    match trusted.iter().find(|key| credential.verify(key)) {
        Some(key) => {
            println!(
                "valid: nonce {} signed by {} ({})",
                credential.nonce(),
                key.fingerprint(HashAlg::Sha256),
                key.comment()
            );
            Ok(())
        }
        None => bail!(
            "signature does not verify against any of the {} directory key(s) for {identity}",
            trusted.len()
        ),
    }
}
