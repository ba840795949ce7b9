//! End-to-end lifecycle tests driving the public pipeline API.
//!
//! These exercise whole runs: the built-in book pipeline offline, cascade
//! and reset across layers, moving a project between orchestrator
//! instances, and job interruption/resume semantics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, json};

use pipeline::core::gate::GateValidator;
use pipeline::core::state::{AgentStatus, ProjectStatus};
use pipeline::jobs::{JobLimits, JobManager, JobStatus};
use pipeline::orchestrator::Orchestrator;
use pipeline::registry::Registry;
use pipeline::test_support::{
    FailingExecutor, chain_registry, test_orchestrator, test_orchestrator_with_executors,
    test_stores,
};

/// The full built-in book pipeline completes offline: with no generation
/// backend or executors attached, every agent passes on placeholder content
/// and every layer unlocks in order.
#[tokio::test]
async fn offline_book_pipeline_runs_to_completion() {
    let (job_store, project_store, _temp) = test_stores();
    let registry = Registry::book_pipeline().expect("registry");
    let agent_count = registry.agents().count();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        GateValidator::new().expect("gate"),
        Duration::from_secs(5),
    ));
    let manager = Arc::new(JobManager::new(job_store, project_store, JobLimits::default()));

    let mut constraints = Map::new();
    constraints.insert("genre".to_string(), json!("mystery"));
    let project = orchestrator
        .create_project("The Tide Clock", constraints)
        .await;

    let job = manager
        .create_run_pipeline_job(Arc::clone(&orchestrator), &project.project_id, None)
        .await
        .expect("create job");
    manager.wait(&job.job_id).await.expect("wait");

    let finished = manager.get(&job.job_id).await.expect("get").expect("job");
    assert_eq!(finished.status, JobStatus::Succeeded, "{:?}", finished.error);

    let project = orchestrator
        .get_project(&project.project_id)
        .await
        .expect("project");
    assert_eq!(project.status, ProjectStatus::Completed);
    let passed = project
        .layers
        .values()
        .flat_map(|layer| layer.agents.values())
        .filter(|state| state.status == AgentStatus::Passed)
        .count();
    assert_eq!(passed, agent_count, "every agent passes on placeholders");

    let manuscript = orchestrator.export_manuscript(&project);
    assert_eq!(manuscript.get("title"), Some(&json!("The Tide Clock")));
}

/// A terminal failure cascades to every transitive dependent (each error
/// naming the root), and resetting the root returns them all to pending.
#[tokio::test]
async fn terminal_failure_cascades_and_reset_reverses() {
    let orchestrator = test_orchestrator(chain_registry());
    let mut project = orchestrator.create_project("Cascade", Map::new()).await;
    let _ = orchestrator
        .execute_agent(&mut project, "first", Some(Arc::new(FailingExecutor)))
        .await;

    for dependent in ["second", "third"] {
        let state = project.agent_state(dependent).expect("state");
        assert_eq!(state.status, AgentStatus::Failed, "{dependent}");
        assert!(
            state.last_error.as_deref().expect("error").contains("first"),
            "{dependent} must name the root failure"
        );
    }

    orchestrator
        .reset_agent(&mut project, "first")
        .expect("reset");
    for agent_id in ["first", "second", "third"] {
        assert_eq!(
            project.agent_status(agent_id),
            Some(AgentStatus::Pending),
            "{agent_id}"
        );
    }
    assert_eq!(orchestrator.get_available_agents(&project), ["first"]);
}

/// A project exported from one orchestrator continues under a fresh one:
/// passed state and outputs survive, and scheduling picks up where it left
/// off.
#[tokio::test]
async fn exported_project_moves_between_orchestrators() {
    let source = test_orchestrator(chain_registry());
    let mut project = source.create_project("Move", Map::new()).await;
    source
        .run_to_completion(&mut project, 1)
        .await
        .expect("one step");
    assert_eq!(project.agent_status("first"), Some(AgentStatus::Passed));
    source.commit_project(&project).await;
    let exported = source.export_project(&project).expect("export");

    let target = test_orchestrator(chain_registry());
    let mut imported = target.import_project(exported).await.expect("import");
    assert_eq!(imported.agent_state("first"), project.agent_state("first"));
    assert_eq!(target.get_available_agents(&imported), ["second"]);

    target
        .run_to_completion(&mut imported, 10)
        .await
        .expect("run");
    assert_eq!(imported.status, ProjectStatus::Completed);
}

/// A pipeline that can never progress ends as a blocked job carrying
/// diagnostics naming the stuck agents and their unmet dependencies, never a
/// silent hang.
#[tokio::test]
async fn stuck_pipeline_ends_blocked_with_diagnostics() {
    let (job_store, project_store, _temp) = test_stores();
    let orchestrator = Arc::new(test_orchestrator(chain_registry()));
    let manager = Arc::new(JobManager::new(job_store, project_store, JobLimits::default()));

    let mut project = orchestrator.create_project("Stuck", Map::new()).await;
    // A skipped agent is neither runnable nor terminal: its layer can never
    // complete and nothing downstream can start.
    project
        .agent_state_mut("first")
        .expect("first agent")
        .status = AgentStatus::Skipped;
    orchestrator.commit_project(&project).await;

    let job = manager
        .create_run_pipeline_job(Arc::clone(&orchestrator), &project.project_id, None)
        .await
        .expect("create job");
    manager.wait(&job.job_id).await.expect("wait");

    let finished = manager.get(&job.job_id).await.expect("get").expect("job");
    assert_eq!(finished.status, JobStatus::Blocked);
    assert!(finished.status.is_resumable());
    assert!(finished.error.as_deref().expect("error").contains("blocked"));

    let diagnostics = finished
        .progress
        .get("blocked_diagnostics")
        .expect("diagnostics attached");
    let blocked = diagnostics
        .get("blocked")
        .and_then(|value| value.as_array())
        .expect("blocked agents");
    assert!(
        blocked.iter().any(|agent| {
            agent.get("agent_id") == Some(&json!("second"))
                && agent
                    .get("unmet_dependencies")
                    .and_then(|deps| deps.as_array())
                    .is_some_and(|deps| deps
                        .iter()
                        .any(|dep| dep.get("dep_id") == Some(&json!("first"))))
        }),
        "diagnostics must name second's unmet dependency on first"
    );

    let final_project = orchestrator
        .get_project(&project.project_id)
        .await
        .expect("project");
    assert_eq!(final_project.status, ProjectStatus::Blocked);
}

/// A record persisted as running with no live task (a previous process died)
/// reloads as interrupted, resumes into a linked job, and finishes without
/// replaying completed agents.
#[tokio::test]
async fn interrupted_job_resumes_into_linked_job() {
    let (job_store, project_store, _temp) = test_stores();
    let orchestrator = Arc::new(test_orchestrator(chain_registry()));
    let manager = Arc::new(JobManager::new(
        Arc::clone(&job_store),
        project_store,
        JobLimits::default(),
    ));

    let project = orchestrator.create_project("Resume", Map::new()).await;
    let stale = json!({
        "job_id": "job-stale",
        "project_id": project.project_id,
        "status": "running",
        "created_at": "2026-01-10T00:00:00Z",
        "updated_at": "2026-01-10T00:00:00Z",
        "started_at": "2026-01-10T00:00:00Z",
        "finished_at": null,
        "error": null,
        "progress": {},
        "events": [],
        "cancel_requested": false,
        "resumed_from_job_id": null
    });
    job_store.save_raw("job-stale", &stale).expect("save");

    manager.load_persisted_jobs().await.expect("load");
    let stale_job = manager.get("job-stale").await.expect("get").expect("job");
    assert_eq!(stale_job.status, JobStatus::Interrupted);

    let resumed = manager
        .resume_job(Arc::clone(&orchestrator), "job-stale", None)
        .await
        .expect("resume");
    assert_eq!(resumed.resumed_from_job_id.as_deref(), Some("job-stale"));
    manager.wait(&resumed.job_id).await.expect("wait");

    let finished = manager
        .get(&resumed.job_id)
        .await
        .expect("get")
        .expect("job");
    assert_eq!(finished.status, JobStatus::Succeeded);
}

/// Resuming a job that is queued/running is refused, as is resuming an old
/// record while its successor is still active for the same project.
#[tokio::test]
async fn active_jobs_cannot_be_resumed() {
    let (job_store, project_store, _temp) = test_stores();
    let orchestrator = Arc::new(test_orchestrator_with_executors(
        chain_registry(),
        &[
            ("first", Duration::from_millis(100)),
            ("second", Duration::from_millis(100)),
            ("third", Duration::from_millis(100)),
        ],
    ));
    let manager = Arc::new(JobManager::new(
        Arc::clone(&job_store),
        project_store,
        JobLimits::default(),
    ));

    let project = orchestrator.create_project("Busy", Map::new()).await;
    let running = manager
        .create_run_pipeline_job(Arc::clone(&orchestrator), &project.project_id, None)
        .await
        .expect("create job");

    let err = manager
        .resume_job(Arc::clone(&orchestrator), &running.job_id, None)
        .await
        .expect_err("running job is not resumable");
    assert!(err.to_string().contains("not resumable"));

    manager.cancel(&running.job_id).await.expect("cancel");
    manager.wait(&running.job_id).await.expect("wait");

    // The cancelled job resumes; a second resume while that successor is
    // active is refused by the one-job-per-project guard.
    let successor = manager
        .resume_job(Arc::clone(&orchestrator), &running.job_id, None)
        .await
        .expect("resume cancelled job");
    let err = manager
        .resume_job(Arc::clone(&orchestrator), &running.job_id, None)
        .await
        .expect_err("project already owned by the successor");
    assert!(err.to_string().contains("active job"));

    manager.cancel(&successor.job_id).await.expect("cancel");
    manager.wait(&successor.job_id).await.expect("wait");
}
