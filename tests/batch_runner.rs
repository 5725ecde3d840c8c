//! Integration tests for the task driver and batch scheduler.
//!
//! A scripted in-memory provider stands in for real infrastructure so
//! failures can be injected at every lifecycle step.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use agent_vm_runner::metrics::RunnerMetrics;
use agent_vm_runner::runner::{
    EnvironmentHandle, EnvironmentSpec, FailureStage, LaunchRequest, RemoteProvider,
    RunnerConfig, SubmissionLog, Task, TaskDriver, TaskOutcome,
};
use agent_vm_runner::scheduler::BatchScheduler;
use agent_vm_runner::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Create,
    CopyTo,
    Launch,
    Completion,
    Trace,
    CopyFrom,
    Delete,
}

#[derive(Debug, Clone, Default)]
struct Script {
    fail_at: Option<Step>,
    panic_on_launch: bool,
    /// Completion checks that error before the agent reports a result.
    failing_checks: usize,
    /// Checks that report "still running" before the result appears.
    pending_checks: usize,
    never_complete: bool,
    provision_delay: Duration,
}

#[derive(Debug, Default)]
struct State {
    created: Vec<String>,
    deleted: Vec<String>,
    launched: HashMap<String, String>,
    running: usize,
    peak_running: usize,
    checks: HashMap<String, usize>,
    pushed: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

struct ScriptedProvider {
    script: Script,
    state: Mutex<State>,
}

impl ScriptedProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            state: Mutex::new(State::default()),
        })
    }

    fn fails_at(&self, step: Step) -> bool {
        self.script.fail_at == Some(step)
    }

    fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn peak_running(&self) -> usize {
        self.state.lock().unwrap().peak_running
    }

    fn pushed_files(&self, env: &str) -> BTreeMap<String, Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .pushed
            .get(env)
            .cloned()
            .unwrap_or_default()
    }

    fn injected(name: &str, step: Step) -> String {
        format!("injected {:?} failure for {}", step, name)
    }
}

#[async_trait]
impl RemoteProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError> {
        if !self.script.provision_delay.is_zero() {
            tokio::time::sleep(self.script.provision_delay).await;
        }
        if self.fails_at(Step::Create) {
            return Err(ProviderError::Provisioning {
                name: spec.name.clone(),
                reason: Self::injected(&spec.name, Step::Create),
            });
        }
        self.state.lock().unwrap().created.push(spec.name.clone());
        Ok(EnvironmentHandle::new(spec))
    }

    async fn copy_to(&self, env: &EnvironmentHandle, local_dir: &Path) -> Result<(), ProviderError> {
        if self.fails_at(Step::CopyTo) {
            return Err(ProviderError::Transfer {
                name: env.name().to_string(),
                reason: Self::injected(env.name(), Step::CopyTo),
            });
        }

        let mut files = BTreeMap::new();
        for entry in walkdir::WalkDir::new(local_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(relative, std::fs::read(entry.path()).unwrap());
        }
        self.state
            .lock()
            .unwrap()
            .pushed
            .entry(env.name().to_string())
            .or_default()
            .extend(files);
        Ok(())
    }

    async fn launch(
        &self,
        env: &EnvironmentHandle,
        request: &LaunchRequest,
    ) -> Result<(), ProviderError> {
        if self.script.panic_on_launch {
            panic!("launcher exploded");
        }
        if self.fails_at(Step::Launch) {
            return Err(ProviderError::Launch {
                name: env.name().to_string(),
                reason: Self::injected(env.name(), Step::Launch),
            });
        }

        let mut state = self.state.lock().unwrap();
        state
            .launched
            .insert(env.name().to_string(), request.task_id.clone());
        state.running += 1;
        state.peak_running = state.peak_running.max(state.running);
        Ok(())
    }

    async fn check_completion(
        &self,
        env: &EnvironmentHandle,
    ) -> Result<Option<TaskOutcome>, ProviderError> {
        let check = {
            let mut state = self.state.lock().unwrap();
            let count = state.checks.entry(env.name().to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if self.fails_at(Step::Completion) || check <= self.script.failing_checks {
            return Err(ProviderError::CompletionCheck {
                name: env.name().to_string(),
                reason: Self::injected(env.name(), Step::Completion),
            });
        }
        if self.script.never_complete
            || check <= self.script.failing_checks + self.script.pending_checks
        {
            return Ok(None);
        }

        let task_id = env.task_id().unwrap_or_default();
        Ok(Some(TaskOutcome::success(json!({ "answer": task_id }))))
    }

    async fn fetch_trace(&self, env: &EnvironmentHandle) -> Result<Option<String>, ProviderError> {
        if self.fails_at(Step::Trace) {
            return Err(ProviderError::TraceFetch {
                name: env.name().to_string(),
                reason: Self::injected(env.name(), Step::Trace),
            });
        }
        Ok(env.task_id().map(|id| format!("trace for {}", id)))
    }

    async fn copy_from(
        &self,
        env: &EnvironmentHandle,
        local_dir: &Path,
    ) -> Result<(), ProviderError> {
        if self.fails_at(Step::CopyFrom) {
            return Err(ProviderError::ArtifactCopy {
                name: env.name().to_string(),
                reason: Self::injected(env.name(), Step::CopyFrom),
            });
        }
        std::fs::write(local_dir.join("workspace.txt"), env.name())?;
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(name.to_string());
        if self.fails_at(Step::Delete) {
            return Err(ProviderError::Cleanup {
                name: name.to_string(),
                reason: Self::injected(name, Step::Delete),
            });
        }
        if state.launched.contains_key(name) {
            state.running -= 1;
        }
        Ok(())
    }
}

fn test_config(log_dir: &Path, max_concurrent: usize) -> RunnerConfig {
    RunnerConfig::new()
        .with_log_dir(log_dir)
        .with_run_id("run-test")
        .with_benchmark("unit")
        .with_max_concurrent(max_concurrent)
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
        .with_agent_dir(log_dir.join("agent"))
}

fn driver_for(provider: Arc<ScriptedProvider>, config: RunnerConfig) -> Arc<TaskDriver> {
    Arc::new(TaskDriver::new(
        provider,
        Arc::new(config),
        Arc::new(RunnerMetrics::new().unwrap()),
    ))
}

fn tasks(ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(*id, json!({ "prompt": format!("solve {}", id) })))
        .collect()
}

fn submissions_path(dir: &Path) -> PathBuf {
    dir.join("run-test_RAW_SUBMISSIONS.jsonl")
}

#[tokio::test]
async fn test_batch_respects_concurrency_limit() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        provision_delay: Duration::from_millis(20),
        pending_checks: 2,
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 2));
    let scheduler = BatchScheduler::from_driver(driver);

    let results = scheduler.run_batch(tasks(&["t1", "t2", "t3"])).await;

    assert_eq!(results.len(), 3);
    for (id, outcome) in &results {
        assert_eq!(outcome, &TaskOutcome::Success(json!({ "answer": id })));
    }
    assert!(provider.peak_running() <= 2);
    assert_eq!(provider.created().len(), 3);
    assert_eq!(provider.deleted().len(), 3);

    let recorded = SubmissionLog::load(&submissions_path(temp.path())).unwrap();
    assert_eq!(recorded, results);
}

#[tokio::test]
async fn test_provisioning_failure_is_recorded_and_cleaned_up() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        fail_at: Some(Step::Create),
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 4));
    let scheduler = BatchScheduler::from_driver(Arc::clone(&driver));

    let results = scheduler.run_batch(tasks(&["a", "b", "c"])).await;

    assert_eq!(results.len(), 3);
    assert!(results
        .values()
        .all(|o| matches!(o, TaskOutcome::Error(msg) if msg.contains("injected Create"))));
    // Deletion is attempted by name even though nothing was created.
    assert!(provider.created().is_empty());
    assert_eq!(provider.deleted().len(), 3);
    assert_eq!(driver.metrics().tasks_with_outcome("error"), 3);
    assert_eq!(driver.metrics().active_environments(), 0);

    let content = std::fs::read_to_string(submissions_path(temp.path())).unwrap();
    assert_eq!(content.lines().count(), 3);
    assert!(content.contains("ERROR: "));
}

#[tokio::test]
async fn test_cleanup_attempted_once_under_each_failure() {
    for step in [
        Step::Create,
        Step::CopyTo,
        Step::Launch,
        Step::Completion,
        Step::CopyFrom,
    ] {
        let temp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(Script {
            fail_at: Some(step),
            ..Script::default()
        });
        let config = test_config(temp.path(), 1).with_timeout(Duration::from_millis(100));
        let driver = driver_for(Arc::clone(&provider), config);

        let outcome = driver.process(&tasks(&["only"])[0]).await;

        let deleted = provider.deleted();
        assert_eq!(deleted.len(), 1, "delete count after {:?} failure", step);
        match step {
            Step::Create | Step::CopyTo | Step::Launch => {
                assert!(matches!(outcome, TaskOutcome::Error(_)), "{:?}: {}", step, outcome);
            }
            Step::Completion => {
                assert!(matches!(outcome, TaskOutcome::Timeout { .. }), "{:?}: {}", step, outcome);
            }
            Step::CopyFrom => {
                // Artifact copy failure keeps the result.
                assert!(outcome.is_success(), "{:?}: {}", step, outcome);
                assert_eq!(driver.metrics().nonfatal_failures(FailureStage::ArtifactCopy), 1);
            }
            Step::Trace | Step::Delete => unreachable!(),
        }

        let recorded = SubmissionLog::load(&submissions_path(temp.path())).unwrap();
        assert_eq!(recorded.get("only"), Some(&outcome));
    }
}

#[tokio::test]
async fn test_timeout_not_before_deadline() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        never_complete: true,
        ..Script::default()
    });
    let timeout = Duration::from_millis(300);
    let poll = Duration::from_millis(20);
    let config = test_config(temp.path(), 1)
        .with_timeout(timeout)
        .with_poll_interval(poll);
    let driver = driver_for(Arc::clone(&provider), config);

    let started = Instant::now();
    let outcome = driver.process(&tasks(&["slow"])[0]).await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, TaskOutcome::Timeout { .. }));
    assert!(elapsed >= timeout, "timed out early after {:?}", elapsed);
    assert!(elapsed < timeout + poll + Duration::from_secs(2));
    assert_eq!(provider.deleted().len(), 1);
}

#[tokio::test]
async fn test_completion_check_recovers_after_failures() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        failing_checks: 2,
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));

    let outcome = driver.process(&tasks(&["flaky"])[0]).await;

    assert_eq!(outcome, TaskOutcome::Success(json!({ "answer": "flaky" })));
    assert_eq!(
        driver.metrics().nonfatal_failures(FailureStage::CompletionCheck),
        2
    );
}

#[tokio::test]
async fn test_failing_trace_fetch_does_not_stop_polling() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        fail_at: Some(Step::Trace),
        pending_checks: 3,
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));

    let outcome = driver.process(&tasks(&["quiet"])[0]).await;

    assert_eq!(outcome, TaskOutcome::Success(json!({ "answer": "quiet" })));
    // One fetch per poll: three pending checks plus the final one.
    assert_eq!(driver.metrics().nonfatal_failures(FailureStage::LogFetch), 4);
    assert!(!temp.path().join("agent_logs/quiet_log.log").exists());
    assert!(!temp.path().join("agent_logs/combined_logs.log").exists());
    assert_eq!(provider.deleted().len(), 1);
}

#[tokio::test]
async fn test_failed_delete_keeps_environment_counted() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        fail_at: Some(Step::Delete),
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));

    let outcome = driver.process(&tasks(&["stuck"])[0]).await;

    assert!(outcome.is_success(), "{}", outcome);
    assert_eq!(provider.deleted().len(), 1);
    assert_eq!(driver.metrics().nonfatal_failures(FailureStage::Cleanup), 1);
    assert_eq!(driver.metrics().active_environments(), 1);
}

#[tokio::test]
async fn test_confirmed_delete_releases_environment() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script::default());
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));

    let outcome = driver.process(&tasks(&["clean"])[0]).await;

    assert!(outcome.is_success(), "{}", outcome);
    assert_eq!(driver.metrics().nonfatal_failures(FailureStage::Cleanup), 0);
    assert_eq!(driver.metrics().active_environments(), 0);
}

#[tokio::test]
async fn test_panic_becomes_error_outcome() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script {
        panic_on_launch: true,
        ..Script::default()
    });
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));

    let outcome = driver.process(&tasks(&["boom"])[0]).await;

    match &outcome {
        TaskOutcome::Error(msg) => assert!(msg.contains("launcher exploded"), "{}", msg),
        other => panic!("expected error outcome, got {}", other),
    }
    assert_eq!(provider.deleted().len(), 1);
    assert_eq!(driver.metrics().active_environments(), 0);
}

#[tokio::test]
async fn test_staged_files_logs_and_artifacts() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("x.csv");
    std::fs::write(&source, b"id,value\n1,42\n").unwrap();

    let provider = ScriptedProvider::new(Script::default());
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 1));
    let task = Task::new(
        "files-task",
        json!({
            "prompt": "read the csv",
            "files": { "data/x.csv": source.to_string_lossy() }
        }),
    );

    let outcome = driver.process(&task).await;
    assert!(outcome.is_success());

    let env = &provider.created()[0];
    let pushed = provider.pushed_files(env);
    assert_eq!(pushed["data/x.csv"], b"id,value\n1,42\n".to_vec());
    let input: Value = serde_json::from_slice(&pushed["input.json"]).unwrap();
    assert_eq!(input["files-task"]["prompt"], "read the csv");
    assert!(pushed.contains_key("agent_args.json"));

    let trace = std::fs::read_to_string(
        temp.path().join("agent_logs").join("files-task_log.log"),
    )
    .unwrap();
    assert_eq!(trace, "trace for files-task");
    assert!(temp.path().join("agent_logs/combined_logs.log").exists());

    let artifact = temp.path().join("files-task").join("workspace.txt");
    assert_eq!(std::fs::read_to_string(artifact).unwrap(), *env);
}

#[tokio::test]
async fn test_unsafe_task_id_stays_inside_log_dir() {
    let temp = TempDir::new().unwrap();
    let results = temp.path().join("results");
    let provider = ScriptedProvider::new(Script::default());
    let driver = driver_for(Arc::clone(&provider), test_config(&results, 1));

    let outcome = driver.process(&tasks(&["../escape"])[0]).await;
    assert!(outcome.is_success(), "{}", outcome);

    assert!(results.join(".._escape/workspace.txt").exists());
    assert!(results.join("agent_logs/.._escape_log.log").exists());
    assert!(!temp.path().join("escape").exists());
    assert!(!results.join("escape_log.log").exists());

    let recorded = SubmissionLog::load(&submissions_path(&results)).unwrap();
    assert_eq!(recorded.get("../escape"), Some(&outcome));
}

#[tokio::test]
async fn test_resume_skips_recorded_tasks() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        submissions_path(temp.path()),
        "{\"done\": \"TIMEOUT after 60 seconds\"}\n",
    )
    .unwrap();

    let provider = ScriptedProvider::new(Script::default());
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 2));
    let scheduler = BatchScheduler::from_driver(driver);

    let recorded = SubmissionLog::load(&submissions_path(temp.path())).unwrap();
    let results = scheduler
        .run_batch_resuming(tasks(&["done", "fresh"]), recorded)
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results["done"], TaskOutcome::Timeout { seconds: 60 });
    assert!(results["fresh"].is_success());
    assert_eq!(provider.created().len(), 1);

    let after = SubmissionLog::load(&submissions_path(temp.path())).unwrap();
    assert_eq!(after, results);
}

#[tokio::test]
async fn test_duplicate_ids_are_all_logged() {
    let temp = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(Script::default());
    let driver = driver_for(Arc::clone(&provider), test_config(temp.path(), 2));
    let scheduler = BatchScheduler::from_driver(driver);

    let results = scheduler.run_batch(tasks(&["dup", "dup"])).await;

    assert_eq!(results.len(), 1);
    let content = std::fs::read_to_string(submissions_path(temp.path())).unwrap();
    assert_eq!(content.lines().count(), 2);
    assert_eq!(provider.deleted().len(), 2);
}
