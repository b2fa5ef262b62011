#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # mailxfer
//!
//! Command-line front end for the transfer engine.
//!
//! ## Subcommands
//!
//! - `mailxfer get <url>...`: run transfers concurrently, one JSON line per result
//! - `mailxfer mailbox info`: message count and unread UIDs
//! - `mailxfer mailbox uids [--flag F] [--invert]`: search the mailbox
//! - `mailxfer mailbox fetch <uid>`: fetch one message
//! - `mailxfer mailbox flag <uid> <flag> [--clear]`: change a flag
//! - `mailxfer digest <file>`: digest of a local file
//!
//! Results go to stdout as JSON lines; logs go to stderr. The exit status is
//! 1 if any transfer or operation failed, 2 on configuration errors.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{error, info};

use mailxfer::config::{Config, ConfigError};
use mailxfer::mail::{Flag, MailClient, MailError};
use mailxfer::transport::NetTransport;
use mailxfer::xfer::error::XferError;
use mailxfer::xfer::hasher::{self, DigestAlgorithm};
use mailxfer::xfer::manager::SessionManager;
use mailxfer::xfer::options::{OptionKey, UserData};
use mailxfer::xfer::types::TransferRequest;

/// Managed transfer sessions for mail retrieval.
#[derive(Parser)]
#[command(name = "mailxfer", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer one or more URLs concurrently.
    Get {
        #[arg(required = true)]
        urls: Vec<String>,
        /// Username for every URL.
        #[arg(long)]
        user: Option<String>,
        /// Password for every URL.
        #[arg(long)]
        password: Option<String>,
        /// Custom request (HTTP method or IMAP command).
        #[arg(long)]
        request: Option<String>,
        /// Digest algorithm, overriding `[engine] digest`.
        #[arg(long)]
        digest: Option<DigestAlgorithm>,
        /// Save each payload into this directory.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Operations on the configured mail account.
    Mailbox {
        /// Mailbox name, overriding `[mail] mailbox`.
        #[arg(long)]
        mailbox: Option<String>,
        #[command(subcommand)]
        action: MailboxAction,
    },
    /// Digest of a local file.
    Digest {
        file: PathBuf,
        #[arg(long, default_value = "sha256")]
        algorithm: DigestAlgorithm,
    },
}

#[derive(Subcommand)]
enum MailboxAction {
    /// Message count and unread UIDs.
    Info,
    /// UIDs since the configured date, optionally filtered on a flag.
    Uids {
        #[arg(long)]
        flag: Option<Flag>,
        /// Match messages without the flag.
        #[arg(long, requires = "flag")]
        invert: bool,
    },
    /// Fetch one message.
    Fetch {
        uid: u32,
        /// Write the message here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Set or clear a flag.
    Flag {
        uid: u32,
        flag: Flag,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Xfer(#[from] XferError),
    #[error("{}: {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("mailxfer: configuration error: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let status = match run(cli.command, &config).await {
        Ok(ok) => i32::from(!ok),
        Err(CliError::Config(e)) => {
            eprintln!("mailxfer: configuration error: {e}");
            2
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            emit(&json!({ "error": e.to_string() }));
            1
        }
    };
    std::process::exit(status);
}

/// Returns whether everything succeeded.
async fn run(command: Commands, config: &Config) -> Result<bool, CliError> {
    match command {
        Commands::Get {
            urls,
            user,
            password,
            request,
            digest,
            output,
        } => {
            let opts = GetOptions {
                user,
                password,
                request,
                digest,
                output,
            };
            get(urls, opts, config).await
        }
        Commands::Mailbox { mailbox, action } => {
            let mailbox = mailbox.unwrap_or_else(|| config.mail.mailbox.clone());
            mailbox_command(&mailbox, action, config).await?;
            Ok(true)
        }
        Commands::Digest { file, algorithm } => {
            let digest = hasher::hash_file(&file, algorithm)
                .await
                .map_err(|e| CliError::Io(file.clone(), e))?;
            emit(&json!({
                "file": file.display().to_string(),
                "algorithm": algorithm,
                "digest": digest,
            }));
            Ok(true)
        }
    }
}

struct GetOptions {
    user: Option<String>,
    password: Option<String>,
    request: Option<String>,
    digest: Option<DigestAlgorithm>,
    output: Option<PathBuf>,
}

async fn get(urls: Vec<String>, opts: GetOptions, config: &Config) -> Result<bool, CliError> {
    let transport = Arc::new(NetTransport::new(config.engine.max_connections));
    let manager = SessionManager::new(transport, config.engine.manager_config()?);

    if let Some(dir) = &opts.output {
        std::fs::create_dir_all(dir).map_err(|e| CliError::Io(dir.clone(), e))?;
    }

    let mut failed = false;
    for (i, url) in urls.into_iter().enumerate() {
        let mut req = TransferRequest::new(url.as_str()).label(url.as_str());
        if let Some(user) = &opts.user {
            req = req.option(OptionKey::Username, user.as_str());
        }
        if let Some(password) = &opts.password {
            req = req.option(OptionKey::Password, password.as_str());
        }
        if let Some(command) = &opts.request {
            req = req.custom_request(command.as_str());
        }
        if let Some(algorithm) = opts.digest {
            req = req.digest(algorithm);
        }
        if let Some(dir) = &opts.output {
            let path = dir.join(output_name(i, &url));
            let file = File::create(&path).map_err(|e| CliError::Io(path.clone(), e))?;
            let data: UserData = Arc::new(Mutex::new(file));
            req = req.on_chunk(Some(data), write_to_file);
        }
        if let Err(e) = manager.submit(req).await {
            failed = true;
            emit(&json!({ "label": url, "status": e.code(), "error": e.to_string() }));
        }
    }

    let summary = manager.run_all().await;
    for result in manager.results().await {
        emit(&result.to_json());
    }
    info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Done"
    );
    Ok(!failed && summary.failed == 0 && summary.cancelled == 0)
}

fn write_to_file(chunk: &[u8], data: Option<&UserData>) -> usize {
    let Some(file) = data.and_then(|d| d.downcast_ref::<Mutex<File>>()) else {
        return 0;
    };
    let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
    match file.write_all(chunk) {
        Ok(()) => chunk.len(),
        Err(_) => 0,
    }
}

/// `<index>-<last path segment>`, with anything unsafe in a file name replaced.
fn output_name(index: usize, url: &str) -> String {
    let tail = url
        .trim_end_matches('/')
        .rsplit(['/', ';', '='])
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("body");
    let tail: String = tail
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{index}-{tail}")
}

async fn mailbox_command(
    mailbox: &str,
    action: MailboxAction,
    config: &Config,
) -> Result<(), CliError> {
    let server = config.mail.server(chrono::Local::now().date_naive())?;
    let transport = Arc::new(NetTransport::new(config.engine.max_connections));
    let client = MailClient::new(server, transport, config.engine.manager_config()?);

    match action {
        MailboxAction::Info => {
            let info = client.mailbox_info(mailbox).await?;
            emit(&json!({ "mailbox": mailbox, "messages": info.messages, "unread": info.unread }));
        }
        MailboxAction::Uids { flag, invert } => {
            let uids = client.uids(mailbox, flag, invert).await?;
            emit(&json!({ "mailbox": mailbox, "uids": uids }));
        }
        MailboxAction::Fetch { uid, output } => {
            let message = client.read_message(mailbox, uid).await?;
            match &output {
                Some(path) => std::fs::write(path, &message.raw)
                    .map_err(|e| CliError::Io(path.clone(), e))?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout
                        .write_all(&message.raw)
                        .and_then(|()| stdout.flush())
                        .map_err(|e| CliError::Io(PathBuf::from("<stdout>"), e))?;
                }
            }
            if output.is_some() {
                emit(&json!({ "mailbox": mailbox, "message": message }));
            }
        }
        MailboxAction::Flag { uid, flag, clear } => {
            client.set_flag(mailbox, uid, flag, !clear).await?;
            emit(&json!({ "mailbox": mailbox, "uid": uid, "flag": flag, "set": !clear }));
        }
    }
    Ok(())
}

fn emit(value: &Value) {
    println!("{value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_name() {
        assert_eq!(output_name(0, "https://example.com/files/a.txt"), "0-a.txt");
        assert_eq!(output_name(1, "imaps://mail.example.com/INBOX;UID=7"), "1-7");
        assert_eq!(output_name(2, "https://example.com/"), "2-example.com");
        assert_eq!(output_name(3, "https://example.com/a%20b"), "3-a_20b");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "mailxfer", "--config", "x.toml", "get", "https://a", "https://b", "--digest", "md5",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(
            cli.command,
            Commands::Get { ref urls, digest: Some(DigestAlgorithm::Md5), .. } if urls.len() == 2
        ));

        let cli = Cli::try_parse_from(["mailxfer", "mailbox", "flag", "7", "seen", "--clear"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Mailbox {
                action: MailboxAction::Flag { uid: 7, flag: Flag::Seen, clear: true },
                ..
            }
        ));
        assert!(Cli::try_parse_from(["mailxfer", "mailbox", "uids", "--invert"]).is_err());
    }
}
