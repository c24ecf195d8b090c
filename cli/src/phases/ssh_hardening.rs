//! Phase 4: SSH hardening — key-only auth, no root login, sshd restart.
//!
//! The full prior `sshd_config` is captured into rollback data before any
//! edit, so rollback is a byte-exact restore.

use anyhow::{Context, Result};

use crate::command_runner::{CommandRunner, CommandSpec};
use crate::domain::error::SystemCommandError;

use super::{PhaseContext, PhaseOutcome, classify_failure};

const RB_PRIOR_CONFIG: &str = "sshd_config.prior";

/// Directives enforced by this phase.
const HARDENING_DIRECTIVES: &[(&str, &str)] = &[
    ("PasswordAuthentication", "no"),
    ("PermitRootLogin", "no"),
    ("PubkeyAuthentication", "yes"),
];

pub async fn execute<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome> {
    match run(ctx).await {
        Ok(()) => Ok(PhaseOutcome::Success),
        Err(e) => classify_failure(e),
    }
}

async fn run<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let path = &ctx.paths.sshd_config;
    let prior = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    ctx.rollback
        .insert(RB_PRIOR_CONFIG.to_string(), prior.clone());

    let hardened = apply_directives(&prior);
    std::fs::write(path, &hardened).with_context(|| format!("writing {}", path.display()))?;

    // Syntax check before touching the running daemon. A config that fails
    // here means the engine rolls the file back and sshd never restarts
    // with bad config.
    ctx.runner
        .execute(&CommandSpec::new("sshd").arg("-t"))
        .await?
        .ensure_success("sshd -t")?;

    restart_sshd(ctx).await
}

pub async fn verify<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<bool> {
    let content = match std::fs::read_to_string(&ctx.paths.sshd_config) {
        Ok(c) => c,
        Err(_) => return Ok(false),
    };
    for (key, value) in HARDENING_DIRECTIVES {
        if !has_directive(&content, key, value) {
            return Ok(false);
        }
    }
    let check = ctx
        .runner
        .execute(&CommandSpec::new("sshd").arg("-t"))
        .await?;
    Ok(check.succeeded)
}

pub async fn rollback<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let Some(prior) = ctx.rollback.get(RB_PRIOR_CONFIG).cloned() else {
        return Ok(());
    };
    let path = &ctx.paths.sshd_config;
    std::fs::write(path, prior).with_context(|| format!("restoring {}", path.display()))?;
    restart_sshd(ctx).await
}

/// Restart the SSH daemon. The unit is `ssh` on Debian and `sshd` on
/// Fedora; try both before giving up.
async fn restart_sshd<R: CommandRunner>(ctx: &PhaseContext<'_, R>) -> Result<()> {
    let mut last_stderr = String::new();
    for unit in ["sshd", "ssh"] {
        let result = ctx
            .runner
            .execute(&CommandSpec::new("systemctl").args(["restart", unit]))
            .await?;
        if result.succeeded {
            return Ok(());
        }
        last_stderr = result.stderr;
    }
    Err(SystemCommandError {
        program: "systemctl restart sshd".to_string(),
        exit_code: 1,
        stderr: last_stderr.trim().to_string(),
    }
    .into())
}

/// Rewrite `content` so every hardening directive is present exactly once,
/// uncommented, with the enforced value. Unrelated lines pass through
/// untouched.
fn apply_directives(content: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut seen = [false; HARDENING_DIRECTIVES.len()];

    for line in content.lines() {
        let trimmed = line.trim_start();
        let stripped = trimmed.strip_prefix('#').map_or(trimmed, str::trim_start);
        let mut replaced = false;
        for (i, (key, value)) in HARDENING_DIRECTIVES.iter().enumerate() {
            let matches_key = stripped
                .split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(key));
            if matches_key {
                if !seen[i] {
                    lines.push(format!("{key} {value}"));
                    seen[i] = true;
                }
                replaced = true;
                break;
            }
        }
        if !replaced {
            lines.push(line.to_string());
        }
    }

    for (i, (key, value)) in HARDENING_DIRECTIVES.iter().enumerate() {
        if !seen[i] {
            lines.push(format!("{key} {value}"));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn has_directive(content: &str, key: &str, value: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            return false;
        }
        let mut parts = trimmed.split_whitespace();
        parts.next().is_some_and(|k| k.eq_ignore_ascii_case(key))
            && parts.next().is_some_and(|v| v.eq_ignore_ascii_case(value))
    })
}
