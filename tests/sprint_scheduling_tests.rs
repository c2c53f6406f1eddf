//! Sprint scheduling scenarios: readiness gating across sprints, failure
//! isolation, and deterministic resume identifiers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ensemble_core::scheduler::{derive_resume_id, SchedulerConfig, SprintScheduler};
use ensemble_core::workflow::{ExecutionStatus, StepDefinition, WorkflowDefinition};

use common::{pipeline_workflow, RecordingHandler};

async fn settle() {
    // Paused-clock runs: let the spawned sprint loop take its immediate
    // first tick.
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn next_sprint() {
    tokio::time::sleep(Duration::from_secs(31)).await;
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_unlocks_one_stage_per_completion() {
    let scheduler = SprintScheduler::default();
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring(pipeline_workflow("pipeline"), Arc::clone(&handler) as _)
        .unwrap();
    settle().await;

    // Sprint 1: only the root step is ready.
    assert_eq!(handler.assigned_steps(), ["fetch"]);

    // Completing fetch unlocks build and only build.
    scheduler.update_step_status("pipeline", "fetch", ExecutionStatus::Completed);
    next_sprint().await;
    assert_eq!(handler.assigned_steps(), ["fetch", "build"]);

    // Completing build unlocks test.
    scheduler.update_step_status("pipeline", "build", ExecutionStatus::Completed);
    next_sprint().await;
    assert_eq!(handler.assigned_steps(), ["fetch", "build", "test"]);

    scheduler.update_step_status("pipeline", "test", ExecutionStatus::Completed);
    next_sprint().await;
    // Nothing left; later sprints stay empty but are still recorded.
    assert_eq!(handler.assigned_steps(), ["fetch", "build", "test"]);
    let state = scheduler.get_workflow_state("pipeline").unwrap();
    assert!(state.current_sprint >= 4);
    assert!(state.sprints.last().unwrap().assignments.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_dependency_never_becomes_ready() {
    let scheduler = SprintScheduler::default();
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring(pipeline_workflow("doomed"), Arc::clone(&handler) as _)
        .unwrap();
    settle().await;

    scheduler.update_step_status("doomed", "fetch", ExecutionStatus::Failed);
    for _ in 0..3 {
        next_sprint().await;
    }

    // build and test stay blocked behind the failed fetch.
    assert_eq!(handler.assigned_steps(), ["fetch"]);
    let state = scheduler.get_workflow_state("doomed").unwrap();
    assert_eq!(state.step_status["build"], ExecutionStatus::Pending);
    assert_eq!(state.step_status["test"], ExecutionStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_independent_step_proceeds_past_unrelated_failure() {
    let workflow = WorkflowDefinition {
        name: "forked".to_string(),
        description: None,
        agents: vec![],
        steps: vec![
            StepDefinition::new("flaky_root"),
            StepDefinition::new("stable_root"),
            StepDefinition {
                depends_on: vec!["stable_root".to_string()],
                ..StepDefinition::new("downstream")
            },
        ],
    };
    let scheduler = SprintScheduler::default();
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring(workflow, Arc::clone(&handler) as _)
        .unwrap();
    settle().await;

    scheduler.update_step_status("forked", "flaky_root", ExecutionStatus::Failed);
    scheduler.update_step_status("forked", "stable_root", ExecutionStatus::Completed);
    next_sprint().await;

    // The branch behind the healthy root keeps flowing.
    assert!(handler.assigned_steps().contains(&"downstream".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_resume_ids_survive_stop_and_restart() {
    let scheduler = SprintScheduler::default();
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring(pipeline_workflow("durable"), Arc::clone(&handler) as _)
        .unwrap();
    settle().await;

    let before = scheduler.get_resume_ids("durable").unwrap();
    let builder_id = before["builder"].clone();
    assert_eq!(builder_id, derive_resume_id("durable", "builder"));

    scheduler.stop_monitoring("durable");
    scheduler
        .start_monitoring(pipeline_workflow("durable"), RecordingHandler::new() as _)
        .unwrap();
    settle().await;

    let after = scheduler.get_resume_ids("durable").unwrap();
    assert_eq!(after["builder"], builder_id, "resume id must be reproducible");
}

#[tokio::test(start_paused = true)]
async fn test_custom_interval_controls_sprint_cadence() {
    let scheduler = SprintScheduler::new(SchedulerConfig {
        sprint_interval: Duration::from_secs(300),
        default_agent: "default".to_string(),
    });
    let handler = RecordingHandler::new();
    scheduler
        .start_monitoring_with_interval(
            pipeline_workflow("fast"),
            Arc::clone(&handler) as _,
            Duration::from_secs(5),
        )
        .unwrap();
    settle().await;

    scheduler.update_step_status("fast", "fetch", ExecutionStatus::Completed);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(handler.assigned_steps(), ["fetch", "build"]);
}

#[tokio::test(start_paused = true)]
async fn test_handler_panic_free_error_does_not_stop_loop() {
    struct FailingHandler;

    #[async_trait::async_trait]
    impl ensemble_core::scheduler::AssignmentHandler for FailingHandler {
        async fn on_assignments(
            &self,
            _workflow: &str,
            _sprint_number: u64,
            _assignments: &[ensemble_core::scheduler::state::AgentAssignment],
        ) -> anyhow::Result<()> {
            anyhow::bail!("executor crashed")
        }
    }

    let scheduler = SprintScheduler::default();
    scheduler
        .start_monitoring(pipeline_workflow("resilient"), Arc::new(FailingHandler))
        .unwrap();
    settle().await;

    scheduler.update_step_status("resilient", "fetch", ExecutionStatus::Completed);
    next_sprint().await;

    // The loop survived the handler error and kept assigning.
    let state = scheduler.get_workflow_state("resilient").unwrap();
    assert!(state.current_sprint >= 2);
    assert_eq!(state.step_status["build"], ExecutionStatus::Running);
}
