//! Narrow package-manager interface over the command runner.
//!
//! Phases consume this instead of issuing package commands directly, so the
//! acceptable-exit-code rule lives in exactly one table below. Package names
//! are re-validated here even though callers pass constants — the validator
//! is the contract, not the call site.

use crate::command_runner::{CommandRunner, CommandSpec, PKG_TIMEOUT};
use crate::domain::error::ValidationError;
use crate::domain::validate;

/// Packages the phases need on a Debian-family host.
pub const REQUIRED_PACKAGES_DEB: &[&str] = &["wireguard-tools", "openssh-server", "ufw"];

/// Packages the phases need on a Fedora-family host.
pub const REQUIRED_PACKAGES_RPM: &[&str] = &["wireguard-tools", "openssh-server", "ufw"];

/// Supported package tools. Closed set; detection picks the first available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageTool {
    AptGet,
    Dnf,
}

/// Package operations with distinct exit-code conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgOp {
    RefreshCache,
    CheckUpdate,
    Install,
    Remove,
    Query,
}

impl PackageTool {
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::AptGet => "apt-get",
            Self::Dnf => "dnf",
        }
    }

    /// Non-zero exit codes that mean success, per (tool, operation).
    ///
    /// This is the single declared table the rest of the code consults.
    /// `dnf check-update` exits 100 when updates are available; everything
    /// else is zero-only. Extend here, never inline at a call site.
    #[must_use]
    pub fn acceptable_codes(self, op: PkgOp) -> &'static [i32] {
        match (self, op) {
            (Self::Dnf, PkgOp::CheckUpdate) => &[100],
            _ => &[],
        }
    }

    #[must_use]
    pub fn required_packages(self) -> &'static [&'static str] {
        match self {
            Self::AptGet => REQUIRED_PACKAGES_DEB,
            Self::Dnf => REQUIRED_PACKAGES_RPM,
        }
    }
}

/// Detect the host's package tool by probing for the binary.
///
/// apt-get is probed first: Debian is the primary target of the original
/// provisioning flow.
pub async fn detect_tool<R: CommandRunner>(runner: &R) -> Option<PackageTool> {
    for tool in [PackageTool::AptGet, PackageTool::Dnf] {
        let spec = CommandSpec::new(tool.program()).arg("--version");
        if let Ok(result) = runner.execute(&spec).await
            && result.succeeded
        {
            return Some(tool);
        }
    }
    None
}

/// Package operations bound to a runner and a detected tool.
pub struct PackageManager<'a, R: CommandRunner> {
    runner: &'a R,
    tool: PackageTool,
}

impl<'a, R: CommandRunner> PackageManager<'a, R> {
    #[must_use]
    pub fn new(runner: &'a R, tool: PackageTool) -> Self {
        Self { runner, tool }
    }

    #[must_use]
    pub fn tool(&self) -> PackageTool {
        self.tool
    }

    /// Refresh the package cache.
    ///
    /// # Errors
    ///
    /// Executor errors, or `SystemCommandError` if the tool reports failure.
    pub async fn refresh_cache(&self) -> anyhow::Result<()> {
        let spec = match self.tool {
            PackageTool::AptGet => CommandSpec::new("apt-get").arg("update"),
            PackageTool::Dnf => CommandSpec::new("dnf")
                .args(["check-update", "--refresh"])
                .accept_codes(self.tool.acceptable_codes(PkgOp::CheckUpdate)),
        }
        .timeout(PKG_TIMEOUT);
        let program = spec.program().to_string();
        self.runner
            .execute(&spec)
            .await?
            .ensure_success(&program)?;
        Ok(())
    }

    /// Install packages. Names are validated before entering argv.
    ///
    /// # Errors
    ///
    /// `ValidationError` on a bad package name, executor errors, or
    /// `SystemCommandError` on tool failure.
    pub async fn install(&self, packages: &[&str]) -> anyhow::Result<()> {
        let validated = validate_names(packages)?;
        let spec = match self.tool {
            PackageTool::AptGet => CommandSpec::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .args(validated)
                .env("DEBIAN_FRONTEND", "noninteractive"),
            PackageTool::Dnf => CommandSpec::new("dnf")
                .args(["install", "-y"])
                .args(validated),
        }
        .timeout(PKG_TIMEOUT);
        let program = spec.program().to_string();
        self.runner
            .execute(&spec)
            .await?
            .ensure_success(&program)?;
        Ok(())
    }

    /// Remove packages (rollback path for system-prep).
    ///
    /// # Errors
    ///
    /// Same as `install`.
    pub async fn remove(&self, packages: &[&str]) -> anyhow::Result<()> {
        let validated = validate_names(packages)?;
        let spec = match self.tool {
            PackageTool::AptGet => CommandSpec::new("apt-get")
                .args(["remove", "-y"])
                .args(validated)
                .env("DEBIAN_FRONTEND", "noninteractive"),
            PackageTool::Dnf => CommandSpec::new("dnf")
                .args(["remove", "-y"])
                .args(validated),
        }
        .timeout(PKG_TIMEOUT);
        let program = spec.program().to_string();
        self.runner
            .execute(&spec)
            .await?
            .ensure_success(&program)?;
        Ok(())
    }

    /// Whether a package is currently installed.
    ///
    /// # Errors
    ///
    /// `ValidationError` on a bad name, executor errors. A non-zero exit
    /// from the query tool means "not installed", not an error.
    pub async fn is_installed(&self, package: &str) -> anyhow::Result<bool> {
        let name = validate::package_name(package)?;
        let spec = match self.tool {
            PackageTool::AptGet => CommandSpec::new("dpkg").args(["-s", &name]),
            PackageTool::Dnf => CommandSpec::new("rpm").args(["-q", &name]),
        };
        let result = self.runner.execute(&spec).await?;
        match self.tool {
            PackageTool::AptGet => {
                Ok(result.succeeded && result.stdout.contains("Status: install ok installed"))
            }
            PackageTool::Dnf => Ok(result.succeeded),
        }
    }
}

fn validate_names(packages: &[&str]) -> Result<Vec<String>, ValidationError> {
    packages.iter().map(|p| validate::package_name(p)).collect()
}
