//! Phase 3: firewall — ufw rules for WireGuard and SSH, then enable.

use anyhow::Result;

use crate::command_runner::{CommandRunner, CommandSpec};
use crate::domain::validate;

use super::{PhaseContext, PhaseOutcome, classify_failure};

const RB_PRIOR_STATUS: &str = "ufw.prior_status";
const RB_ADDED_RULES: &str = "ufw.added_rules";

pub async fn execute<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome> {
    match run(ctx).await {
        Ok(()) => Ok(PhaseOutcome::Success),
        Err(e) => classify_failure(e),
    }
}

async fn run<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let wg_port = validate::port(&ctx.network.wireguard_port.to_string())?;
    let ssh_port = validate::port(&ctx.network.ssh_port.to_string())?;

    let status = ctx
        .runner
        .execute(&CommandSpec::new("ufw").arg("status"))
        .await?
        .ensure_success("ufw status")?;
    ctx.rollback
        .insert(RB_PRIOR_STATUS.to_string(), status.stdout.clone());

    let rules = [format!("{wg_port}/udp"), format!("{ssh_port}/tcp")];
    for rule in &rules {
        ctx.runner
            .execute(&CommandSpec::new("ufw").args(["allow", rule]))
            .await?
            .ensure_success("ufw allow")?;
    }
    ctx.rollback
        .insert(RB_ADDED_RULES.to_string(), rules.join(","));

    // --force suppresses the interactive "may disrupt ssh" prompt; the ssh
    // allow rule above is added first for exactly that reason.
    ctx.runner
        .execute(&CommandSpec::new("ufw").args(["--force", "enable"]))
        .await?
        .ensure_success("ufw enable")?;
    Ok(())
}

pub async fn verify<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<bool> {
    let Ok(wg_port) = validate::port(&ctx.network.wireguard_port.to_string()) else {
        return Ok(false);
    };
    let status = ctx
        .runner
        .execute(&CommandSpec::new("ufw").arg("status"))
        .await?;
    if !status.succeeded {
        return Ok(false);
    }
    Ok(status.stdout.contains("Status: active") && status.stdout.contains(&format!("{wg_port}/udp")))
}

pub async fn rollback<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    if let Some(rules) = ctx.rollback.get(RB_ADDED_RULES).cloned() {
        for rule in rules.split(',').filter(|r| !r.is_empty()) {
            let _ = ctx
                .runner
                .execute(&CommandSpec::new("ufw").args(["delete", "allow", rule]))
                .await;
        }
    }
    // Only disable if the firewall was inactive before this phase touched it.
    if let Some(prior) = ctx.rollback.get(RB_PRIOR_STATUS)
        && prior.contains("Status: inactive")
    {
        let _ = ctx
            .runner
            .execute(&CommandSpec::new("ufw").args(["--force", "disable"]))
            .await;
    }
    Ok(())
}
