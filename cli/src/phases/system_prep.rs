//! Phase 1: system preparation — package cache refresh and base packages.

use anyhow::Result;

use crate::command_runner::CommandRunner;
use crate::domain::error::SystemCommandError;
use crate::pkg::{self, PackageManager};

use super::{PhaseContext, PhaseOutcome, classify_failure};

/// Rollback key listing packages this phase newly installed.
const RB_INSTALLED: &str = "packages.installed";

pub async fn execute<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome> {
    match run(ctx).await {
        Ok(()) => Ok(PhaseOutcome::Success),
        Err(e) => classify_failure(e),
    }
}

async fn run<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let Some(tool) = pkg::detect_tool(ctx.runner).await else {
        return Err(SystemCommandError {
            program: "apt-get/dnf".to_string(),
            exit_code: -1,
            stderr: "no supported package manager found".to_string(),
        }
        .into());
    };
    let mgr = PackageManager::new(ctx.runner, tool);

    mgr.refresh_cache().await?;

    // Only packages we actually install go into rollback data, so rollback
    // never removes something that was already on the host.
    let mut newly_installed = Vec::new();
    for package in tool.required_packages() {
        if !mgr.is_installed(package).await? {
            newly_installed.push(*package);
        }
    }
    if !newly_installed.is_empty() {
        mgr.install(&newly_installed).await?;
        ctx.rollback
            .insert(RB_INSTALLED.to_string(), newly_installed.join(","));
    }
    Ok(())
}

pub async fn verify<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<bool> {
    let Some(tool) = pkg::detect_tool(ctx.runner).await else {
        return Ok(false);
    };
    let mgr = PackageManager::new(ctx.runner, tool);
    for package in tool.required_packages() {
        if !mgr.is_installed(package).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub async fn rollback<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let Some(installed) = ctx.rollback.get(RB_INSTALLED) else {
        return Ok(());
    };
    let packages: Vec<&str> = installed.split(',').filter(|s| !s.is_empty()).collect();
    if packages.is_empty() {
        return Ok(());
    }
    let Some(tool) = pkg::detect_tool(ctx.runner).await else {
        return Ok(());
    };
    PackageManager::new(ctx.runner, tool).remove(&packages).await
}
