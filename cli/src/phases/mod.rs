//! Provisioning phases — named, ordered units of work with
//! execute/verify/rollback semantics.
//!
//! The set of phases is closed: `STANDARD_PHASES` enumerates them and
//! `StandardPhases` dispatches on id. The `PhaseSet` trait exists so the
//! engine can be driven by synthetic phases in tests without touching a
//! real host.

pub mod firewall;
pub mod ssh_hardening;
pub mod system_prep;
pub mod wireguard;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::command_runner::CommandRunner;
use crate::domain::config::{NetworkSettings, ServerInfo};
use crate::domain::error::{CommandError, SystemCommandError, ValidationError};

/// Immutable phase metadata. Defined at startup, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct PhaseDescriptor {
    pub id: u8,
    pub name: &'static str,
    /// Phase ids that must be COMPLETED before this phase may run.
    pub depends_on: &'static [u8],
}

/// The provisioning sequence, in declared order.
pub const STANDARD_PHASES: &[PhaseDescriptor] = &[
    PhaseDescriptor {
        id: 1,
        name: "system-prep",
        depends_on: &[],
    },
    PhaseDescriptor {
        id: 2,
        name: "wireguard-server",
        depends_on: &[1],
    },
    PhaseDescriptor {
        id: 3,
        name: "firewall",
        depends_on: &[2],
    },
    PhaseDescriptor {
        id: 4,
        name: "ssh-hardening",
        depends_on: &[1],
    },
];

/// Look up a descriptor by id.
#[must_use]
pub fn descriptor(id: u8) -> Option<&'static PhaseDescriptor> {
    STANDARD_PHASES.iter().find(|d| d.id == id)
}

/// Outcome of a phase's execute step, as data. The engine's transitions are
/// driven by this value, not by catching error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Success,
    /// An input failed allow-list validation. Never auto-corrected.
    ValidationFailed(String),
    /// A host command could not run or reported failure.
    CommandFailed(String),
}

/// Host paths the phases touch, overridable so tests never write to /etc.
#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub wireguard_dir: PathBuf,
    pub sshd_config: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            sshd_config: PathBuf::from("/etc/ssh/sshd_config"),
        }
    }
}

/// Everything a phase may touch while running.
///
/// The rollback map is scoped to the running phase's own record — phases
/// never see or mutate other phases' rollback data.
pub struct PhaseContext<'a, R: CommandRunner> {
    pub runner: &'a R,
    pub network: &'a NetworkSettings,
    pub server: &'a mut ServerInfo,
    pub rollback: &'a mut BTreeMap<String, String>,
    pub paths: &'a SystemPaths,
}

/// A complete set of phases the engine can drive.
#[allow(async_fn_in_trait)]
pub trait PhaseSet<R: CommandRunner> {
    fn descriptors(&self) -> &[PhaseDescriptor];

    /// Perform the phase's system changes.
    ///
    /// # Errors
    ///
    /// Returns `Err` only for infrastructure failures the phase could not
    /// classify; expected failures come back as a non-`Success` outcome.
    async fn execute(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome>;

    /// Independently re-check that the intended end state holds. Read-only:
    /// calling it twice without an intervening execute returns the same
    /// answer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the check itself could not run.
    async fn verify(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<bool>;

    /// Best-effort reversal using data captured during execute. The engine
    /// logs failures from this method but never lets them mask the
    /// original error.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the reversal could not be applied.
    async fn rollback(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<()>;
}

/// The production phase set.
pub struct StandardPhases;

impl<R: CommandRunner> PhaseSet<R> for StandardPhases {
    fn descriptors(&self) -> &[PhaseDescriptor] {
        STANDARD_PHASES
    }

    async fn execute(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome> {
        match id {
            1 => system_prep::execute(ctx).await,
            2 => wireguard::execute(ctx).await,
            3 => firewall::execute(ctx).await,
            4 => ssh_hardening::execute(ctx).await,
            other => Err(crate::domain::error::PhaseError::NotFound(other).into()),
        }
    }

    async fn verify(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<bool> {
        match id {
            1 => system_prep::verify(ctx).await,
            2 => wireguard::verify(ctx).await,
            3 => firewall::verify(ctx).await,
            4 => ssh_hardening::verify(ctx).await,
            other => Err(crate::domain::error::PhaseError::NotFound(other).into()),
        }
    }

    async fn rollback(&self, id: u8, ctx: &mut PhaseContext<'_, R>) -> Result<()> {
        match id {
            1 => system_prep::rollback(ctx).await,
            2 => wireguard::rollback(ctx).await,
            3 => firewall::rollback(ctx).await,
            4 => ssh_hardening::rollback(ctx).await,
            other => Err(crate::domain::error::PhaseError::NotFound(other).into()),
        }
    }
}

/// Classify a phase-internal failure into an outcome. Validation and
/// command failures are expected and become data; anything else stays an
/// error for the engine to surface.
pub(crate) fn classify_failure(err: anyhow::Error) -> Result<PhaseOutcome> {
    for cause in err.chain() {
        if let Some(v) = cause.downcast_ref::<ValidationError>() {
            return Ok(PhaseOutcome::ValidationFailed(v.to_string()));
        }
        if let Some(c) = cause.downcast_ref::<SystemCommandError>() {
            return Ok(PhaseOutcome::CommandFailed(c.to_string()));
        }
        if let Some(c) = cause.downcast_ref::<CommandError>() {
            return Ok(PhaseOutcome::CommandFailed(c.to_string()));
        }
    }
    Err(err)
}
