//! Run command — execute provisioning phases.

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::domain::error::{PhaseError, PrivilegeError};
use crate::engine::Engine;
use crate::phases::{STANDARD_PHASES, StandardPhases};

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Resume provisioning from the first incomplete phase
    #[arg(long = "continue", conflicts_with = "phase")]
    pub resume: bool,

    /// Run a single phase by id, bypassing dependency checks
    #[arg(long, value_name = "ID")]
    pub phase: Option<u8>,
}

/// Run provisioning in continue mode or jump mode.
///
/// # Errors
///
/// Returns `PhaseError::NotFound` for an unknown phase id, `PrivilegeError`
/// when not running as root, and any phase or store error from the engine.
pub async fn run(ctx: &AppContext, args: &RunArgs) -> Result<()> {
    // Validate the target before the privilege gate so an operator typo is
    // reported as such rather than as a sudo problem.
    if let Some(id) = args.phase
        && !STANDARD_PHASES.iter().any(|d| d.id == id)
    {
        return Err(PhaseError::NotFound(id).into());
    }

    require_root()?;

    let phases = StandardPhases;
    let engine = Engine::new(&ctx.store, &ctx.runner, &phases, &ctx.output);

    match args.phase {
        Some(id) => {
            if !ctx.non_interactive {
                let proceed = ctx.confirm(
                    &format!("run phase {id} directly, bypassing dependency checks?"),
                    false,
                )?;
                if !proceed {
                    ctx.output.info("aborted");
                    return Ok(());
                }
            }
            engine.run_single(id).await
        }
        None => engine.run_continue().await,
    }
}

/// Provisioning mutates interfaces, the firewall, and sshd; all of it
/// requires root.
#[cfg(unix)]
fn require_root() -> Result<(), PrivilegeError> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(PrivilegeError { command: "run" })
    }
}

#[cfg(not(unix))]
fn require_root() -> Result<(), PrivilegeError> {
    Ok(())
}
