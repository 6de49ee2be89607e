//! The `clap`-derived command tree and its dispatch to the library crates.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use registry::Account;
use translog::{CrossAccountTransfer, TransferStatus};
use xfer::{AdmissionError, MoveOutcome, XferEvent};

use crate::events::Emitter;
use crate::Handles;

/// Multi-account cloud storage session and transfer core.
#[derive(Debug, Parser)]
#[command(name = "vaultsync", version, about)]
pub struct Cli {
    /// Increase logging verbosity; repeat for more detail (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Overrides the resolved config directory (for tests and portable installs).
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage registered accounts.
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage account groups.
    #[command(subcommand)]
    Group(GroupCommand),

    /// Copies files from one account to another.
    Copy {
        /// Source account id.
        #[arg(long)]
        from: String,
        /// Target account id.
        #[arg(long)]
        to: String,
        /// Destination folder path on the target account.
        #[arg(long)]
        dest: String,
        /// Absolute source paths to copy.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Moves files from one account to another.
    Move {
        /// Source account id.
        #[arg(long)]
        from: String,
        /// Target account id.
        #[arg(long)]
        to: String,
        /// Destination folder path on the target account.
        #[arg(long)]
        dest: String,
        /// Proceed even if a source path has an active public share that would break.
        #[arg(long)]
        skip_link_warning: bool,
        /// Absolute source paths to move.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Manage in-flight or completed cross-account transfers.
    #[command(subcommand)]
    Transfer(TransferCommand),

    /// Query the transfer history.
    #[command(subcommand)]
    Log(LogCommand),
}

/// `vaultsync account ...`
#[derive(Debug, Subcommand)]
pub enum AccountCommand {
    /// Logs in and registers a new account.
    Add {
        /// Login email.
        #[arg(long)]
        email: String,
        /// Password; prompted interactively if neither this nor `--session-file` is given.
        #[arg(long, conflicts_with = "session_file")]
        password: Option<String>,
        /// Path to a file containing a previously stored provider session token.
        #[arg(long)]
        session_file: Option<PathBuf>,
    },

    /// Lists every registered account.
    List,

    /// Removes a registered account.
    Remove {
        /// Account id.
        id: String,
        /// Keep the stored session credential instead of deleting it.
        #[arg(long)]
        keep_session: bool,
    },

    /// Makes an account the active one.
    Switch {
        /// Account id.
        id: String,
    },

    /// Searches accounts by email, display name, or label.
    Search {
        /// Substring query.
        query: String,
    },
}

/// `vaultsync group ...`
#[derive(Debug, Subcommand)]
pub enum GroupCommand {
    /// Creates a new group.
    Add {
        /// Group display name.
        #[arg(long)]
        name: String,
    },

    /// Removes a group, reparenting its accounts to the default group.
    Remove {
        /// Group id.
        id: String,
        /// Accepted for command-surface parity; the registry's default
        /// group always exists, so accounts are never left without one.
        #[arg(long)]
        no_reparent: bool,
    },
}

/// `vaultsync transfer ...`
#[derive(Debug, Subcommand)]
pub enum TransferCommand {
    /// Cancels a running transfer.
    Cancel {
        /// Transfer id.
        id: String,
    },
    /// Retries a failed, retryable transfer.
    Retry {
        /// Transfer id.
        id: String,
    },
}

/// `vaultsync log ...`
#[derive(Debug, Subcommand)]
pub enum LogCommand {
    /// Lists recent transfers, optionally filtered.
    List {
        /// Filter by lifecycle status (`pending`, `in_progress`, `completed`, `failed`, `cancelled`).
        #[arg(long)]
        status: Option<String>,
        /// Filter to transfers where this account id is either endpoint.
        #[arg(long)]
        account: Option<String>,
        /// Maximum rows to return.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Substring-searches transfer paths.
    Search {
        /// Substring query.
        query: String,
    },
}

pub(crate) async fn dispatch<Out: Write>(
    command: Command,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    match command {
        Command::Account(cmd) => account(cmd, ctx, emitter).await,
        Command::Group(cmd) => group(cmd, ctx, emitter).await,
        Command::Copy { from, to, dest, paths } => {
            copy(from, to, dest, paths, ctx, emitter).await
        }
        Command::Move {
            from,
            to,
            dest,
            skip_link_warning,
            paths,
        } => move_files(from, to, dest, skip_link_warning, paths, ctx, emitter).await,
        Command::Transfer(cmd) => transfer(cmd, ctx, emitter).await,
        Command::Log(cmd) => log(cmd, ctx, emitter).await,
    }
}

async fn account<Out: Write>(
    cmd: AccountCommand,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    match cmd {
        AccountCommand::Add {
            email,
            password,
            session_file,
        } => {
            let account = if let Some(path) = session_file {
                add_with_session_file(&email, &path, ctx).await?
            } else {
                let password = match password {
                    Some(p) => p,
                    None => rpassword::prompt_password("Password: ")
                        .context("reading password from terminal")?,
                };
                ctx.registry
                    .add_account(&email, &password)
                    .await
                    .context("logging in")?
            };
            emitter.emit("account_added", &account);
        }
        AccountCommand::List => {
            let accounts = ctx.registry.all_accounts().await;
            emitter.emit("account_list", &serde_json::json!({ "accounts": accounts }));
        }
        AccountCommand::Remove { id, keep_session } => {
            ctx.registry
                .remove_account(&id, !keep_session)
                .await
                .context("removing account")?;
            emitter.emit("account_removed", &serde_json::json!({ "id": id }));
        }
        AccountCommand::Switch { id } => {
            ctx.registry
                .switch_to(&id)
                .await
                .context("switching account")?;
            emitter.emit("account_switched", &serde_json::json!({ "id": id }));
        }
        AccountCommand::Search { query } => {
            let accounts = ctx.registry.search(&query).await;
            emitter.emit("account_search_results", &serde_json::json!({ "accounts": accounts }));
        }
    }
    Ok(())
}

async fn add_with_session_file(
    email: &str,
    path: &PathBuf,
    ctx: &Handles,
) -> anyhow::Result<Account> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("reading session file {}", path.display()))?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("session file {} is empty", path.display());
    }

    let id = registry::new_account_id();
    let remember = ctx.registry.settings().await.remember_login;
    if remember {
        ctx.credentials_store_session(&id, &token)?;
    }
    ctx.ensure_session(&id)
        .await
        .context("restoring session from file")?;
    ctx.registry
        .add_account_with_session(email, &id, remember)
        .await
        .context("registering account")
}

async fn group<Out: Write>(
    cmd: GroupCommand,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    match cmd {
        GroupCommand::Add { name } => {
            let group = ctx.registry.add_group(&name).await.context("adding group")?;
            emitter.emit("group_added", &group);
        }
        GroupCommand::Remove { id, no_reparent: _ } => {
            ctx.registry
                .remove_group(&id, None)
                .await
                .context("removing group")?;
            emitter.emit("group_removed", &serde_json::json!({ "id": id }));
        }
    }
    Ok(())
}

async fn copy<Out: Write>(
    from: String,
    to: String,
    dest: String,
    paths: Vec<String>,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    let rx = ctx.engine.subscribe();
    let id = ctx
        .engine
        .copy(paths, &from, &to, &dest)
        .await
        .map_err(admission_error)?;
    emitter.emit("transfer_queued", &serde_json::json!({ "id": id }));
    await_terminal(id, rx, emitter).await
}

async fn move_files<Out: Write>(
    from: String,
    to: String,
    dest: String,
    skip_link_warning: bool,
    paths: Vec<String>,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    let rx = ctx.engine.subscribe();
    let outcome = ctx
        .engine
        .move_files(paths, &from, &to, &dest, skip_link_warning)
        .await
        .map_err(admission_error)?;

    match outcome {
        MoveOutcome::Enqueued(id) => {
            emitter.emit("transfer_queued", &serde_json::json!({ "id": id }));
            await_terminal(id, rx, emitter).await
        }
        MoveOutcome::SharedLinksWillBreak { paths_with_links } => {
            emitter.emit(
                "shared_links_will_break",
                &serde_json::json!({ "paths_with_links": paths_with_links }),
            );
            Ok(())
        }
    }
}

fn admission_error(e: AdmissionError) -> anyhow::Error {
    anyhow::anyhow!(e)
}

/// Drains `rx` until the transfer identified by `id` reaches a terminal
/// status, printing every progress tick and the final event.
async fn await_terminal<Out: Write>(
    id: String,
    mut rx: tokio::sync::broadcast::Receiver<XferEvent>,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    loop {
        match rx.recv().await {
            Ok(XferEvent::Progress {
                id: event_id,
                percent,
                bytes_transferred,
                bytes_total,
            }) if event_id == id => {
                emitter.emit(
                    "transfer_progress",
                    &serde_json::json!({
                        "id": id,
                        "percent": percent,
                        "bytes_transferred": bytes_transferred,
                        "bytes_total": bytes_total,
                    }),
                );
            }
            Ok(XferEvent::Completed(t)) if t.id == id => {
                emitter.emit("transfer_completed", &t);
                return Ok(());
            }
            Ok(XferEvent::Failed(t)) if t.id == id => {
                emitter.emit("transfer_failed", &t);
                return Ok(());
            }
            Ok(XferEvent::Cancelled(event_id)) if event_id == id => {
                emitter.emit("transfer_cancelled", &serde_json::json!({ "id": id }));
                return Ok(());
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                bail!("transfer engine shut down before {id} reached a terminal status")
            }
        }
    }
}

async fn transfer<Out: Write>(
    cmd: TransferCommand,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    match cmd {
        TransferCommand::Cancel { id } => {
            ctx.engine.cancel(&id);
            emitter.emit("transfer_cancel_requested", &serde_json::json!({ "id": id }));
        }
        TransferCommand::Retry { id } => match ctx.engine.retry(&id).await {
            Some(new_id) => {
                emitter.emit(
                    "transfer_retried",
                    &serde_json::json!({ "original_id": id, "id": new_id }),
                );
            }
            None => bail!("transfer {id} is not eligible for retry"),
        },
    }
    Ok(())
}

async fn log<Out: Write>(
    cmd: LogCommand,
    ctx: &Handles,
    emitter: &mut Emitter<'_, Out>,
) -> anyhow::Result<()> {
    let rows: Vec<CrossAccountTransfer> = match cmd {
        LogCommand::List {
            status,
            account,
            limit,
        } => match (status, account) {
            (Some(status), _) => {
                let status = parse_status(&status)?;
                ctx.log.by_status(status, limit).await?
            }
            (None, Some(account)) => ctx.log.by_account(&account, limit).await?,
            (None, None) => ctx.log.get_all(limit, 0).await?,
        },
        LogCommand::Search { query } => ctx.log.search(&query, 100).await?,
    };
    emitter.emit("transfer_log", &serde_json::json!({ "transfers": rows }));
    Ok(())
}

fn parse_status(s: &str) -> anyhow::Result<TransferStatus> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "pending" => TransferStatus::Pending,
        "in_progress" | "inprogress" => TransferStatus::InProgress,
        "completed" => TransferStatus::Completed,
        "failed" => TransferStatus::Failed,
        "cancelled" | "canceled" => TransferStatus::Cancelled,
        other => bail!("unknown transfer status {other:?}"),
    })
}
