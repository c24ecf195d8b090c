//! Typed domain error enums.
//!
//! This module has zero imports from `crate::commands`, `crate::engine`,
//! `tokio`, `std::fs`, or `std::process`. All error types implement
//! `thiserror::Error` and convert to `anyhow::Error` via the `?` operator.

use thiserror::Error;

/// Process exit codes reported by the `vpnforge` binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const PHASE_FAILURE: i32 = 1;
    pub const CONFIG: i32 = 3;
    pub const PRIVILEGE: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const INTERRUPT: i32 = 130;
}

// ── Validation errors ─────────────────────────────────────────────────────────

/// Untrusted input failed an allow-list grammar.
///
/// Always fatal to the current operation. Validators never sanitize and
/// proceed; rejection is final.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    /// Which input was rejected (e.g. "interface name", "hostname").
    pub field: &'static str,
    /// Why the allow-list grammar rejected it. Never echoes the raw value —
    /// rejected input may contain terminal control bytes.
    pub reason: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

// ── Executor errors ───────────────────────────────────────────────────────────

/// Executor-level process failures: the child never produced a usable result.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    /// Defense-in-depth: an argv element looked like secret material or
    /// contained bytes that could be reinterpreted downstream. Secrets go
    /// through stdin, never through the argument vector.
    #[error("refusing to execute {program}: {reason}")]
    Security { program: String, reason: String },
}

/// The child process ran but reported failure after exit-code mapping.
#[derive(Debug, Error)]
#[error("{program} failed with exit code {exit_code}: {stderr}")]
pub struct SystemCommandError {
    pub program: String,
    pub exit_code: i32,
    pub stderr: String,
}

// ── Phase errors ──────────────────────────────────────────────────────────────

/// Orchestration-level failures.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("phase {phase} requires phase {missing} to be completed first")]
    UnmetDependency { phase: u8, missing: u8 },

    #[error("no phase with id {0}")]
    NotFound(u8),

    #[error("phase {phase} ({name}) failed: {reason}")]
    ExecutionFailed {
        phase: u8,
        name: &'static str,
        reason: String,
    },

    #[error("phase {phase} ({name}) reported success but verification found the change not applied")]
    VerifyFailed { phase: u8, name: &'static str },

    #[error("interrupted by user")]
    Interrupted,
}

// ── Configuration errors ──────────────────────────────────────────────────────

/// Setup document unreadable, corrupt, or unsupported.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no setup document found. Run 'vpnforge run --continue' to start provisioning.")]
    NotFound,

    #[error("setup document has schema version {found}, this build supports up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("setup document is corrupt: {0}")]
    Corrupt(String),

    #[error("setup document changed on disk during update (expected checksum {expected}, found {found})")]
    ConcurrentModification { expected: String, found: String },

    #[error("another vpnforge process holds the lock ({holder})")]
    Locked { holder: String },
}

// ── Privilege errors ──────────────────────────────────────────────────────────

/// Provisioning mutates host state (interfaces, firewall, sshd) and must run
/// as root.
#[derive(Debug, Error)]
#[error("this command must run as root (try: sudo vpnforge {command})")]
pub struct PrivilegeError {
    pub command: &'static str,
}

/// Map the root cause of an error chain to a process exit code.
///
/// The first typed error found in the chain wins; anything unrecognized is a
/// general phase failure.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<PrivilegeError>().is_some() {
            return exit_code::PRIVILEGE;
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG;
        }
        if let Some(phase) = cause.downcast_ref::<PhaseError>() {
            return match phase {
                PhaseError::UnmetDependency { .. } | PhaseError::NotFound(_) => {
                    exit_code::NOT_FOUND
                }
                PhaseError::Interrupted => exit_code::INTERRUPT,
                _ => exit_code::PHASE_FAILURE,
            };
        }
    }
    exit_code::PHASE_FAILURE
}

/// Stable string code for the `--json` error object, one per exit code.
#[must_use]
pub fn error_code_label(code: i32) -> &'static str {
    match code {
        exit_code::CONFIG => "config",
        exit_code::NOT_FOUND => "not-found",
        exit_code::PRIVILEGE => "privilege",
        exit_code::INTERRUPT => "interrupted",
        _ => "phase-failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_config_error() {
        let err = anyhow::Error::from(ConfigError::NotFound);
        assert_eq!(exit_code_for(&err), exit_code::CONFIG);
    }

    #[test]
    fn test_exit_code_for_unmet_dependency() {
        let err = anyhow::Error::from(PhaseError::UnmetDependency { phase: 3, missing: 2 });
        assert_eq!(exit_code_for(&err), exit_code::NOT_FOUND);
    }

    #[test]
    fn test_exit_code_for_interrupt() {
        let err = anyhow::Error::from(PhaseError::Interrupted);
        assert_eq!(exit_code_for(&err), exit_code::INTERRUPT);
    }

    #[test]
    fn test_exit_code_survives_context_wrapping() {
        let err = anyhow::Error::from(PrivilegeError { command: "run" }).context("running phases");
        assert_eq!(exit_code_for(&err), exit_code::PRIVILEGE);
    }

    #[test]
    fn test_exit_code_defaults_to_phase_failure() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&err), exit_code::PHASE_FAILURE);
    }
}
