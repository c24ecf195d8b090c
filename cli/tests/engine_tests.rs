//! Engine behavior tests driven by synthetic phases.
//!
//! These never touch a real host: the runner answers every command with
//! success and the phases record what the engine asked of them.

use std::sync::Mutex;

use tempfile::TempDir;

use vpnforge_cli::command_runner::{CommandResult, CommandRunner, CommandSpec};
use vpnforge_cli::domain::config::PhaseStatus;
use vpnforge_cli::domain::error::{CommandError, PhaseError, exit_code, exit_code_for};
use vpnforge_cli::engine::Engine;
use vpnforge_cli::output::OutputContext;
use vpnforge_cli::phases::{PhaseContext, PhaseDescriptor, PhaseOutcome, PhaseSet};
use vpnforge_cli::state::ConfigStore;

/// Runner that answers every command with success. Synthetic phases never
/// spawn anything, but the engine is generic over a runner.
struct NullRunner;

impl CommandRunner for NullRunner {
    async fn execute(&self, _spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        Ok(CommandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            succeeded: true,
        })
    }
}

const SCRIPT_DESCRIPTORS: &[PhaseDescriptor] = &[
    PhaseDescriptor {
        id: 1,
        name: "alpha",
        depends_on: &[],
    },
    PhaseDescriptor {
        id: 2,
        name: "beta",
        depends_on: &[1],
    },
    PhaseDescriptor {
        id: 3,
        name: "gamma",
        depends_on: &[2],
    },
    PhaseDescriptor {
        id: 4,
        name: "delta",
        depends_on: &[1],
    },
];

/// Phase set whose behavior is scripted per test, recording every call.
#[derive(Default)]
struct ScriptedPhases {
    fail_execute: Vec<u8>,
    fail_verify: Vec<u8>,
    fail_rollback: Vec<u8>,
    /// Phase that writes a rollback snapshot during execute.
    snapshot_phase: Option<u8>,
    /// Phase that records a server public key during execute.
    pubkey_phase: Option<u8>,
    log: Mutex<Vec<String>>,
}

impl ScriptedPhases {
    fn log_call(&self, what: &str, id: u8) {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("{what}:{id}"));
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == entry).count()
    }
}

impl PhaseSet<NullRunner> for ScriptedPhases {
    fn descriptors(&self) -> &[PhaseDescriptor] {
        SCRIPT_DESCRIPTORS
    }

    async fn execute(
        &self,
        id: u8,
        ctx: &mut PhaseContext<'_, NullRunner>,
    ) -> anyhow::Result<PhaseOutcome> {
        self.log_call("execute", id);
        if self.snapshot_phase == Some(id) {
            ctx.rollback
                .insert("snapshot".to_string(), "pre-state".to_string());
        }
        if self.pubkey_phase == Some(id) {
            ctx.server.wg_public_key = Some(format!("{}=", "k".repeat(43)));
        }
        if self.fail_execute.contains(&id) {
            return Ok(PhaseOutcome::CommandFailed("scripted failure".to_string()));
        }
        Ok(PhaseOutcome::Success)
    }

    async fn verify(
        &self,
        id: u8,
        _ctx: &mut PhaseContext<'_, NullRunner>,
    ) -> anyhow::Result<bool> {
        self.log_call("verify", id);
        Ok(!self.fail_verify.contains(&id))
    }

    async fn rollback(
        &self,
        id: u8,
        _ctx: &mut PhaseContext<'_, NullRunner>,
    ) -> anyhow::Result<()> {
        self.log_call("rollback", id);
        if self.fail_rollback.contains(&id) {
            anyhow::bail!("scripted rollback failure");
        }
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: ConfigStore,
    output: OutputContext,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = ConfigStore::with_path(dir.path().join("setup.json"));
        Self {
            _dir: dir,
            store,
            output: OutputContext::new(true, true),
        }
    }

    fn mark_completed(&self, ids: &[u8]) {
        self.store
            .update(|doc| {
                for id in ids {
                    doc.phase_record_mut(*id).status = PhaseStatus::Completed;
                }
            })
            .expect("seed store");
    }

    fn status(&self, id: u8) -> PhaseStatus {
        self.store.load().expect("load").phase_status(id)
    }
}

#[tokio::test]
async fn test_continue_runs_all_phases_in_order() {
    let h = Harness::new();
    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect("run");

    let executes: Vec<String> = phases
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("execute"))
        .collect();
    assert_eq!(executes, vec!["execute:1", "execute:2", "execute:3", "execute:4"]);
    for id in 1..=4 {
        assert_eq!(h.status(id), PhaseStatus::Completed, "phase {id}");
    }
}

#[tokio::test]
async fn test_execute_failure_rolls_back_exactly_once() {
    let h = Harness::new();
    let phases = ScriptedPhases {
        fail_execute: vec![2],
        ..ScriptedPhases::default()
    };
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    let err = engine.run_continue().await.expect_err("phase 2 fails");
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::ExecutionFailed { phase: 2, .. })
    ));

    assert_eq!(phases.count("rollback:2"), 1);
    assert_eq!(h.status(1), PhaseStatus::Completed);
    assert_eq!(h.status(2), PhaseStatus::RolledBack);
    // Nothing downstream of the failure ran.
    assert_eq!(phases.count("execute:3"), 0);
    assert_eq!(phases.count("execute:4"), 0);
}

#[tokio::test]
async fn test_verify_failure_rolls_back() {
    let h = Harness::new();
    let phases = ScriptedPhases {
        fail_verify: vec![1],
        ..ScriptedPhases::default()
    };
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    let err = engine.run_continue().await.expect_err("verify fails");
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::VerifyFailed { phase: 1, .. })
    ));
    assert_eq!(exit_code_for(&err), exit_code::PHASE_FAILURE);
    assert_eq!(phases.count("rollback:1"), 1);
    assert_eq!(h.status(1), PhaseStatus::RolledBack);
}

#[tokio::test]
async fn test_continue_resumes_from_first_incomplete() {
    let h = Harness::new();
    h.store.load_or_init().expect("init");
    h.mark_completed(&[1, 2]);
    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect("run");

    assert_eq!(phases.count("execute:1"), 0);
    assert_eq!(phases.count("execute:2"), 0);
    assert_eq!(phases.count("execute:3"), 1);
    assert_eq!(phases.count("execute:4"), 1);
}

#[tokio::test]
async fn test_run_single_unknown_phase_is_not_found() {
    let h = Harness::new();
    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    let err = engine.run_single(9).await.expect_err("unknown phase");
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::NotFound(9))
    ));
    assert_eq!(exit_code_for(&err), exit_code::NOT_FOUND);
    assert!(phases.calls().is_empty());
}

#[tokio::test]
async fn test_run_single_bypasses_dependencies() {
    let h = Harness::new();
    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    // Phase 3 depends on 2, which has never run.
    engine.run_single(3).await.expect("jump");
    assert_eq!(phases.count("execute:3"), 1);
    assert_eq!(h.status(3), PhaseStatus::Completed);
    assert_eq!(h.status(2), PhaseStatus::Pending);
}

#[tokio::test]
async fn test_continue_respects_dependencies_after_jump() {
    let h = Harness::new();
    h.store.load_or_init().expect("init");
    // Jump completed phase 4; 1..3 still pending.
    h.mark_completed(&[4]);
    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect("run");
    let executes: Vec<String> = phases
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("execute"))
        .collect();
    assert_eq!(executes, vec!["execute:1", "execute:2", "execute:3"]);
}

#[tokio::test]
async fn test_rollback_snapshot_is_persisted() {
    let h = Harness::new();
    let phases = ScriptedPhases {
        fail_execute: vec![1],
        snapshot_phase: Some(1),
        ..ScriptedPhases::default()
    };
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect_err("phase 1 fails");

    let doc = h.store.load().expect("load");
    let record = doc.phases.get(&1).expect("record");
    assert_eq!(
        record.rollback_data.get("snapshot").map(String::as_str),
        Some("pre-state")
    );
    assert_eq!(record.status, PhaseStatus::RolledBack);
}

#[tokio::test]
async fn test_server_info_is_persisted_on_success() {
    let h = Harness::new();
    let phases = ScriptedPhases {
        pubkey_phase: Some(1),
        ..ScriptedPhases::default()
    };
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect("run");

    let doc = h.store.load().expect("load");
    assert!(doc.server.wg_public_key.is_some());
}

#[tokio::test]
async fn test_stale_running_record_is_demoted_and_rerun() {
    let h = Harness::new();
    h.store.load_or_init().expect("init");
    h.mark_completed(&[1]);
    h.store
        .update(|doc| {
            doc.phase_record_mut(2).status = PhaseStatus::Running;
        })
        .expect("seed running");

    let phases = ScriptedPhases::default();
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    engine.run_continue().await.expect("run");

    // The crashed phase was re-executed from scratch, not resumed.
    assert_eq!(phases.count("execute:2"), 1);
    assert_eq!(h.status(2), PhaseStatus::Completed);
}

#[tokio::test]
async fn test_rollback_failure_does_not_mask_original_error() {
    let h = Harness::new();
    let phases = ScriptedPhases {
        fail_execute: vec![1],
        fail_rollback: vec![1],
        ..ScriptedPhases::default()
    };
    let runner = NullRunner;
    let engine = Engine::new(&h.store, &runner, &phases, &h.output);

    let err = engine.run_continue().await.expect_err("phase 1 fails");
    // The surfaced error is the execute failure, not the rollback failure.
    assert!(matches!(
        err.downcast_ref::<PhaseError>(),
        Some(PhaseError::ExecutionFailed { phase: 1, .. })
    ));
    assert_eq!(phases.count("rollback:1"), 1);
    assert_eq!(h.status(1), PhaseStatus::RolledBack);
}

#[tokio::test]
async fn test_verify_is_read_only_and_repeatable() {
    let h = Harness::new();
    let phases = ScriptedPhases::default();
    let runner = NullRunner;

    let doc = h.store.load_or_init().expect("init");
    let mut server = doc.server.clone();
    let mut rollback = std::collections::BTreeMap::new();
    let paths = vpnforge_cli::phases::SystemPaths {
        wireguard_dir: std::env::temp_dir(),
        sshd_config: std::env::temp_dir().join("sshd_config"),
    };
    let mut ctx = PhaseContext {
        runner: &runner,
        network: &doc.network,
        server: &mut server,
        rollback: &mut rollback,
        paths: &paths,
    };

    let first = phases.verify(1, &mut ctx).await.expect("verify");
    let second = phases.verify(1, &mut ctx).await.expect("verify");
    assert_eq!(first, second);
}
