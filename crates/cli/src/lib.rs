//! # Overview
//!
//! `cli` is the thin command surface that exercises the [`registry`] and
//! [`xfer`] crates end-to-end, standing in for "the GUI collaborator"
//! spec.md otherwise assumes is subscribed to every component's events.
//! It is deliberately small: almost no logic lives here that isn't already
//! implemented by a library crate, mirroring the teacher's `bin`/`cli`
//! split where the binary is a near-empty entry point.
//!
//! # Design
//!
//! [`Cli`] is a `clap` derive tree matching the command surface documented
//! for the project. [`run`] parses arguments, wires up one [`credentials::CredentialStore`],
//! one [`sessions::SessionPool`], one [`registry::Registry`], one
//! [`translog::TransferLogStore`], and one [`xfer::CrossAccountEngine`] rooted at
//! the resolved config directory, dispatches the parsed command, and prints
//! every resulting domain event as one newline-delimited JSON object per
//! line on stdout — a deliberate, minimal substitute for a GUI event
//! subscriber. Diagnostics and `tracing` output go to stderr, leaving
//! stdout exclusively for the NDJSON event stream.
//!
//! This workspace has no real cloud provider to link against (`spec.md`
//! explicitly scopes the wire protocol to the bundled SDK out of its
//! non-goals), so [`run`] wires accounts up against [`sdk::MockProviderClient`]
//! through a small [`DemoClientFactory`], exactly the role the `sdk` crate's
//! mock already plays for every other crate's test suite.
//!
//! # Errors
//!
//! Library-crate errors ([`registry::RegistryError`], [`xfer::AdmissionError`],
//! ...) are wrapped in [`anyhow::Error`] for reporting, per the split the
//! rest of the workspace draws between library crates (`thiserror`) and
//! this binary-facing layer (`anyhow::Context`).

#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod command;
mod events;
mod factory;

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

pub use command::{AccountCommand, Cli, Command, GroupCommand, LogCommand, TransferCommand};
use events::Emitter;
use factory::DemoClientFactory;
use registry::Registry;
use sessions::SessionPool;
use translog::TransferLogStore;
use xfer::CrossAccountEngine;

const MAX_EXIT_CODE: i32 = 255;

/// Runs the CLI against the provided argument iterator, writing the NDJSON
/// event stream to `stdout` and returning the process exit code the caller
/// should use (`0` on success).
pub fn run<I, S, Out>(arguments: I, stdout: &mut Out) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
    Out: Write,
{
    let cli = match Cli::try_parse_from(arguments) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() { 2 } else { 0 };
        }
    };

    logging::install(logging::Verbosity::from_flag_count(cli.verbose)).ok();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return 1;
        }
    };

    match rt.block_on(run_async(cli, stdout)) {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "command failed");
            let mut emitter = Emitter::new(stdout);
            emitter.emit("error", &serde_json::json!({ "message": error.to_string() }));
            1
        }
    }
}

/// Converts a numeric exit code into an [`std::process::ExitCode`], clamping to a single byte.
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    let clamped = status.clamp(0, MAX_EXIT_CODE);
    std::process::ExitCode::from(clamped as u8)
}

async fn run_async<Out: Write>(cli: Cli, stdout: &mut Out) -> anyhow::Result<()> {
    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => Registry::config_dir().context("resolving config directory")?,
    };

    let ctx = Handles::open(&config_dir).await?;
    let mut emitter = Emitter::new(stdout);
    command::dispatch(cli.command, &ctx, &mut emitter).await
}

/// Bundles the live handles every command needs, so `dispatch` doesn't
/// thread five separate arguments through every branch.
pub(crate) struct Handles {
    pub registry: Arc<Registry>,
    pub engine: Arc<CrossAccountEngine>,
    pub log: TransferLogStore,
    credentials: Arc<credentials::CredentialStore>,
    sessions: Arc<SessionPool>,
}

impl Handles {
    async fn open(config_dir: &PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("creating config directory {}", config_dir.display()))?;

        let credentials = Arc::new(
            credentials::CredentialStore::open(config_dir)
                .context("opening credential store")?,
        );
        let factory: Arc<dyn sessions::ClientFactory> =
            Arc::new(DemoClientFactory::new());
        let sessions = Arc::new(SessionPool::new(factory.clone(), credentials.clone()));

        let registry = Registry::open(config_dir, credentials.clone(), sessions.clone(), factory)
            .context("opening account registry")?;

        let log = TransferLogStore::open(&config_dir.join("transfers.db"))
            .context("opening transfer log")?;

        let engine = CrossAccountEngine::new(sessions.clone(), log.clone());
        engine.spawn_default_workers();
        registry.relay_sync_status(engine.subscribe());

        Ok(Self {
            registry,
            engine,
            log,
            credentials,
            sessions,
        })
    }

    /// Persists `token` as `account_id`'s stored session, so a later
    /// [`sessions::SessionPool::ensure_session`] can restore it via the
    /// credential store's [`sessions::TokenSource`] impl.
    pub(crate) fn credentials_store_session(&self, account_id: &str, token: &str) -> anyhow::Result<()> {
        self.credentials
            .store(account_id, token)
            .context("storing session token")
    }

    /// Brings `account_id`'s session up to `Ready` using whatever token
    /// the credential store holds for it.
    pub(crate) async fn ensure_session(
        &self,
        account_id: &str,
    ) -> anyhow::Result<Arc<dyn sdk::ProviderClient>> {
        self.sessions
            .ensure_session(account_id)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_reports_usage_error() {
        let mut out = Vec::new();
        let status = run(["vaultsync", "bogus"], &mut out);
        assert_ne!(status, 0);
    }

    #[test]
    fn version_flag_reports_success() {
        let mut out = Vec::new();
        let status = run(["vaultsync", "--version"], &mut out);
        assert_eq!(status, 0);
    }
}
