//! Phase orchestration — ordering, persistence, rollback.
//!
//! Phases run strictly one at a time: each mutates exclusive host resources
//! (one firewall, one interface, one sshd). Every state transition is
//! persisted through `ConfigStore::update` before control moves on, so a
//! crash between transitions always leaves a consistent, resumable record.

use chrono::Utc;

use anyhow::Result;

use crate::command_runner::{CANCEL_GRACE, CommandRunner};
use crate::domain::config::{PhaseStatus, SetupDocument};
use crate::domain::error::PhaseError;
use crate::output::{OutputContext, progress};
use crate::phases::{PhaseContext, PhaseDescriptor, PhaseOutcome, PhaseSet, SystemPaths};
use crate::state::ConfigStore;

/// Drives a `PhaseSet` against the setup document.
pub struct Engine<'a, R: CommandRunner, P: PhaseSet<R>> {
    store: &'a ConfigStore,
    runner: &'a R,
    phases: &'a P,
    output: &'a OutputContext,
    paths: SystemPaths,
}

impl<'a, R: CommandRunner, P: PhaseSet<R>> Engine<'a, R, P> {
    pub fn new(
        store: &'a ConfigStore,
        runner: &'a R,
        phases: &'a P,
        output: &'a OutputContext,
    ) -> Self {
        Self {
            store,
            runner,
            phases,
            output,
            paths: SystemPaths::default(),
        }
    }

    /// Override host paths (tests).
    #[must_use]
    pub fn with_paths(mut self, paths: SystemPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Continue mode: run the lowest-id non-completed phase whose
    /// dependencies are satisfied, repeating until all phases are
    /// completed or one fails.
    ///
    /// # Errors
    ///
    /// The first phase failure, dependency violation, or store error stops
    /// the run; no dependent phase runs after a failure.
    pub async fn run_continue(&self) -> Result<()> {
        self.store.load_or_init()?;
        self.recover_stale()?;

        loop {
            let doc = self.store.load()?;
            match next_runnable(&doc, self.phases.descriptors()) {
                Selection::Done => {
                    self.output.success("all phases completed");
                    return Ok(());
                }
                Selection::Blocked { phase, missing } => {
                    return Err(PhaseError::UnmetDependency { phase, missing }.into());
                }
                Selection::Run(id) => self.run_one(id, false).await?,
            }
        }
    }

    /// Jump mode: run exactly one phase, bypassing dependency checks. The
    /// bypass is an explicit operator override and is reported prominently.
    ///
    /// # Errors
    ///
    /// `PhaseError::NotFound` for an unknown id, otherwise as `run_continue`.
    pub async fn run_single(&self, id: u8) -> Result<()> {
        let descriptor = self
            .find_descriptor(id)
            .ok_or(PhaseError::NotFound(id))?;
        self.store.load_or_init()?;
        self.recover_stale()?;
        self.output.warn(&format!(
            "running phase {id} ({}) directly — dependency checks bypassed",
            descriptor.name
        ));
        self.run_one(id, true).await
    }

    /// Demote RUNNING records left behind by a crash to FAILED. A phase
    /// interrupted mid-flight is never silently resumed; the operator
    /// re-runs it after rollback.
    fn recover_stale(&self) -> Result<()> {
        let doc = self.store.load()?;
        let stale: Vec<u8> = doc
            .phases
            .iter()
            .filter(|(_, r)| r.status == PhaseStatus::Running)
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.store.update(|doc| {
            for id in &stale {
                let record = doc.phase_record_mut(*id);
                record.status = PhaseStatus::Failed;
                record.finished_at = Some(Utc::now());
            }
        })?;
        for id in stale {
            self.output.warn(&format!(
                "phase {id} was interrupted by a previous crash; marked failed, re-run to retry"
            ));
        }
        Ok(())
    }

    async fn run_one(&self, id: u8, bypass_deps: bool) -> Result<()> {
        let descriptor = self
            .find_descriptor(id)
            .ok_or(PhaseError::NotFound(id))?;
        let doc = self.store.load()?;

        if !bypass_deps
            && let Some(missing) = unmet_dependency(&doc, &descriptor)
        {
            return Err(PhaseError::UnmetDependency { phase: id, missing }.into());
        }

        let spinner = self
            .output
            .show_progress()
            .then(|| progress::spinner(&format!("phase {id}: {}", descriptor.name)));
        if spinner.is_none() {
            self.output
                .header(&format!("phase {id}: {}", descriptor.name));
        }

        // PENDING -> RUNNING, persisted before any host mutation.
        self.store.update(|doc| {
            let record = doc.phase_record_mut(id);
            record.status = PhaseStatus::Running;
            record.started_at = Some(Utc::now());
            record.finished_at = None;
            record.rollback_data.clear();
        })?;
        self.output.debug(&format!("phase {id}: pending -> running"));

        let network = doc.network.clone();
        let mut server = doc.server.clone();
        let mut rollback = std::collections::BTreeMap::new();

        let mut interrupted = false;
        let outcome = {
            let mut ctx = PhaseContext {
                runner: self.runner,
                network: &network,
                server: &mut server,
                rollback: &mut rollback,
                paths: &self.paths,
            };
            let exec = self.phases.execute(id, &mut ctx);
            tokio::pin!(exec);
            tokio::select! {
                outcome = &mut exec => Some(outcome?),
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                    // SIGTERM in-flight children, then keep driving the
                    // phase through the grace period so they can exit
                    // cleanly. Dropping the future afterwards hard-kills
                    // any survivor.
                    self.runner.terminate_running();
                    let _ = tokio::time::timeout(CANCEL_GRACE, &mut exec).await;
                    None
                }
            }
        };

        // Persist whatever pre-state the phase captured before we decide
        // anything else — rollback data must survive a crash from here on.
        self.store.update(|doc| {
            doc.server = server.clone();
            doc.phase_record_mut(id).rollback_data = rollback.clone();
        })?;

        if interrupted {
            if let Some(pb) = &spinner {
                pb.finish_and_clear();
            }
            self.output.error("interrupted; rolling back current phase");
            self.fail_and_roll_back(id, &network, &mut server, &mut rollback)
                .await?;
            return Err(PhaseError::Interrupted.into());
        }

        match outcome.unwrap_or(PhaseOutcome::CommandFailed("no outcome".to_string())) {
            PhaseOutcome::Success => {
                let mut ctx = PhaseContext {
                    runner: self.runner,
                    network: &network,
                    server: &mut server,
                    rollback: &mut rollback,
                    paths: &self.paths,
                };
                if self.phases.verify(id, &mut ctx).await? {
                    self.store.update(|doc| {
                        let record = doc.phase_record_mut(id);
                        record.status = PhaseStatus::Completed;
                        record.finished_at = Some(Utc::now());
                    })?;
                    let done = format!("phase {id} ({}) completed", descriptor.name);
                    if let Some(pb) = &spinner {
                        progress::finish_ok(pb, &done);
                    } else {
                        self.output.success(&done);
                    }
                    Ok(())
                } else {
                    // Exit codes said success; the host disagrees.
                    if let Some(pb) = &spinner {
                        pb.finish_and_clear();
                    }
                    self.fail_and_roll_back(id, &network, &mut server, &mut rollback)
                        .await?;
                    Err(PhaseError::VerifyFailed {
                        phase: id,
                        name: descriptor.name,
                    }
                    .into())
                }
            }
            PhaseOutcome::ValidationFailed(reason) | PhaseOutcome::CommandFailed(reason) => {
                if let Some(pb) = &spinner {
                    pb.finish_and_clear();
                }
                self.fail_and_roll_back(id, &network, &mut server, &mut rollback)
                    .await?;
                Err(PhaseError::ExecutionFailed {
                    phase: id,
                    name: descriptor.name,
                    reason,
                }
                .into())
            }
        }
    }

    /// FAILED, then rollback, then ROLLED_BACK. A rollback failure is
    /// reported but never replaces the original error.
    async fn fail_and_roll_back(
        &self,
        id: u8,
        network: &crate::domain::config::NetworkSettings,
        server: &mut crate::domain::config::ServerInfo,
        rollback: &mut std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        self.store.update(|doc| {
            let record = doc.phase_record_mut(id);
            record.status = PhaseStatus::Failed;
            record.finished_at = Some(Utc::now());
        })?;
        self.output.debug(&format!(
            "phase {id}: failed, invoking rollback with {} captured entries",
            rollback.len()
        ));

        let mut ctx = PhaseContext {
            runner: self.runner,
            network,
            server,
            rollback,
            paths: &self.paths,
        };
        match self.phases.rollback(id, &mut ctx).await {
            Ok(()) => self.output.info(&format!("phase {id} rolled back")),
            Err(e) => self
                .output
                .error(&format!("rollback of phase {id} failed: {e:#}")),
        }

        self.store.update(|doc| {
            doc.phase_record_mut(id).status = PhaseStatus::RolledBack;
        })?;
        Ok(())
    }

    fn find_descriptor(&self, id: u8) -> Option<PhaseDescriptor> {
        self.phases.descriptors().iter().find(|d| d.id == id).copied()
    }
}

/// What continue mode should do next.
#[derive(Debug, PartialEq, Eq)]
enum Selection {
    /// Every phase is completed.
    Done,
    /// Run this phase next.
    Run(u8),
    /// Phases remain but none has its dependencies satisfied.
    Blocked { phase: u8, missing: u8 },
}

fn next_runnable(doc: &SetupDocument, descriptors: &[PhaseDescriptor]) -> Selection {
    let mut first_blocked: Option<(u8, u8)> = None;
    let mut remaining = false;
    for descriptor in descriptors {
        if doc.phase_status(descriptor.id) == PhaseStatus::Completed {
            continue;
        }
        remaining = true;
        match unmet_dependency(doc, descriptor) {
            None => return Selection::Run(descriptor.id),
            Some(missing) => {
                first_blocked.get_or_insert((descriptor.id, missing));
            }
        }
    }
    if !remaining {
        return Selection::Done;
    }
    // Unreachable with a well-formed descriptor table (deps always point at
    // earlier phases), but jump mode can leave earlier phases failed.
    let (phase, missing) = first_blocked.unwrap_or((0, 0));
    Selection::Blocked { phase, missing }
}

fn unmet_dependency(doc: &SetupDocument, descriptor: &PhaseDescriptor) -> Option<u8> {
    descriptor
        .depends_on
        .iter()
        .find(|dep| doc.phase_status(**dep) != PhaseStatus::Completed)
        .copied()
}
