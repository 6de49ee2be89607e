//! Verbosity levels and the `tracing` bridge used by every VaultSync binary and daemon.
//!
//! ## Overview
//!
//! VaultSync has no concept of a foreground console the way a CLI tool does: the same
//! verbosity setting travels with an account (it is part of [`AccountSettings`] in the
//! `registry` crate, persisted to `accounts.json`) and must also be overridable per-process
//! for the `vaultsync` CLI binary via a `-v`/`-q` flag count. [`Verbosity`] is the single
//! small enum both sides agree on; [`install`] turns it into a global `tracing` subscriber.
//!
//! ## Design
//!
//! `RUST_LOG` always wins when present, mirroring every other `tracing-subscriber`-based
//! tool in the ecosystem: operators who already know the `EnvFilter` syntax should never be
//! fought by an application-level verbosity knob. [`Verbosity`] only supplies the *default*
//! filter directive used when `RUST_LOG` is unset.
//!
//! ## Invariants
//!
//! - [`install`] may be called at most once per process; a second call returns
//!   [`LoggingError::AlreadyInstalled`] rather than panicking, since library code (tests,
//!   embedders) may race to install a subscriber.
//! - [`Verbosity`] is ordered: `Quiet < Normal < Verbose < Debug`.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Errors produced while installing the global `tracing` subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// [`install`] was called after a subscriber was already installed in this process.
    #[error("a tracing subscriber is already installed for this process")]
    AlreadyInstalled,
}

/// How much detail VaultSync should log.
///
/// Ordered from least to most verbose. Stored per-account in `AccountSettings` and
/// overridable per-invocation by the CLI's repeated `-v` flag (see [`Verbosity::from_flag_count`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Errors, warnings, and top-level lifecycle events (session ready, transfer completed).
    Normal,
    /// Adds per-step progress (export started, import started, retry scheduled).
    Verbose,
    /// Adds per-crate internal diagnostics (session state transitions, queue admission).
    Debug,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Normal
    }
}

impl Verbosity {
    /// Maps a count of repeated `-v` CLI flags onto a verbosity level.
    ///
    /// `0` is [`Verbosity::Normal`] (the CLI's quiet mode is a separate `-q` flag handled by
    /// the caller, not folded into this count). Counts above 2 saturate at [`Verbosity::Debug`].
    pub fn from_flag_count(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            _ => Verbosity::Debug,
        }
    }

    /// The `EnvFilter` directive string used as the default filter when `RUST_LOG` is unset.
    fn default_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "info,sessions=debug,xfer=debug",
            Verbosity::Debug => "debug",
        }
    }
}

impl FromStr for Verbosity {
    type Err = ParseVerbosityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quiet" => Ok(Verbosity::Quiet),
            "normal" => Ok(Verbosity::Normal),
            "verbose" => Ok(Verbosity::Verbose),
            "debug" => Ok(Verbosity::Debug),
            other => Err(ParseVerbosityError(other.to_string())),
        }
    }
}

/// Returned when a string does not name a known [`Verbosity`] variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown verbosity level: {0:?} (expected one of quiet, normal, verbose, debug)")]
pub struct ParseVerbosityError(String);

/// Installs a global `tracing` subscriber configured for `verbosity`.
///
/// Writes formatted events to stderr, leaving stdout free for the CLI's NDJSON event
/// stream. If `RUST_LOG` is set in the environment it takes precedence over `verbosity`
/// entirely, so operators can always drop down to directive-level filtering.
///
/// Returns [`LoggingError::AlreadyInstalled`] if a global subscriber is already set; this is
/// expected and harmless when called from multiple test modules in the same process.
pub fn install(verbosity: Verbosity) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_orders_quiet_to_debug() {
        assert!(Verbosity::Quiet < Verbosity::Normal);
        assert!(Verbosity::Normal < Verbosity::Verbose);
        assert!(Verbosity::Verbose < Verbosity::Debug);
    }

    #[test]
    fn from_flag_count_saturates_at_debug() {
        assert_eq!(Verbosity::from_flag_count(0), Verbosity::Normal);
        assert_eq!(Verbosity::from_flag_count(1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flag_count(2), Verbosity::Debug);
        assert_eq!(Verbosity::from_flag_count(99), Verbosity::Debug);
    }

    #[test]
    fn from_str_parses_known_levels_case_insensitively() {
        assert_eq!("Verbose".parse::<Verbosity>().unwrap(), Verbosity::Verbose);
        assert_eq!("DEBUG".parse::<Verbosity>().unwrap(), Verbosity::Debug);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn serde_round_trips_through_snake_case() {
        let json = serde_json::to_string(&Verbosity::Verbose).unwrap();
        assert_eq!(json, "\"verbose\"");
        let back: Verbosity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Verbosity::Verbose);
    }

    #[test]
    fn install_is_idempotent_without_panicking() {
        let _ = install(Verbosity::Debug);
        // second call must not panic even if the first one already won the race
        let _ = install(Verbosity::Quiet);
    }
}
