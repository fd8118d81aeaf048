use anyhow::Result;
use async_trait::async_trait;
use stallbook::config::bootstrap_plan::BootstrapPlan;
use stallbook::core::process::AutoConfirm;
use stallbook::domain::ports::{CommandRunner, Invocation};
use stallbook::{
    sequence_from_plan, BootstrapState, DatabaseConfig, DatabaseEngine, StallbookError, StepContext, Store,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SAMPLE_DATA: &str = include_str!("../fixtures/sample_data.json");

/// 記錄所有呼叫，並可在執行時模擬外部工具的副作用
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    side_effect: Option<Box<dyn Fn(&Invocation) + Send + Sync>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> stallbook::Result<Option<i32>> {
        self.calls.lock().unwrap().push(invocation.clone());
        if let Some(effect) = &self.side_effect {
            effect(invocation);
        }
        Ok(Some(0))
    }
}

fn prepare_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
    std::fs::write(dir.path().join("fixtures/sample_data.json"), SAMPLE_DATA).unwrap();
    dir
}

fn context(dir: &Path, database: DatabaseConfig, runner: Arc<RecordingRunner>) -> StepContext {
    StepContext::new(
        "test-bootstrap".to_string(),
        dir.to_path_buf(),
        database,
        runner,
        Arc::new(AutoConfirm),
    )
}

fn count(store: &Store, table: &str) -> i64 {
    store
        .connection()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_default_plan_end_to_end() -> Result<()> {
    let dir = prepare_workspace();
    let runner = Arc::new(RecordingRunner::default());
    let mut ctx = context(dir.path(), DatabaseConfig::default(), runner.clone());

    let mut sequence = sequence_from_plan(&BootstrapPlan::default_plan())?;
    let results = sequence.execute_all(&mut ctx).await?;

    assert_eq!(sequence.state(), &BootstrapState::Completed);
    assert_eq!(results.len(), 5);
    assert!(runner.calls().is_empty());

    let store = Store::open(dir.path().join(".stallbook/stallbook.db"))?;
    assert!(store.pending_migrations()?.is_empty());
    assert_eq!(count(&store, "stalls"), 3);
    assert_eq!(count(&store, "time_slots"), 5);
    assert_eq!(store.get_order(1)?.total_amount.to_string(), "₹110.00");
    Ok(())
}

#[tokio::test]
async fn test_running_twice_is_idempotent() -> Result<()> {
    let dir = prepare_workspace();
    let plan = BootstrapPlan::default_plan();

    for _ in 0..2 {
        let mut ctx = context(dir.path(), DatabaseConfig::default(), Arc::new(RecordingRunner::default()));
        let mut sequence = sequence_from_plan(&plan)?;
        sequence.execute_all(&mut ctx).await?;
    }

    let store = Store::open(dir.path().join(".stallbook/stallbook.db"))?;
    assert_eq!(count(&store, "accounts"), 4);
    assert_eq!(count(&store, "order_items"), 3);
    assert_eq!(count(&store, "schema_migrations"), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_manifest_halts_before_installer() -> Result<()> {
    let dir = prepare_workspace();
    let runner = Arc::new(RecordingRunner::default());
    let mut ctx = context(dir.path(), DatabaseConfig::default(), runner.clone());

    let plan = BootstrapPlan::from_str(
        r#"
[sequence]
name = "missing-manifest"

[[steps]]
kind = "create-env"

[[steps]]
kind = "activate"

[[steps]]
kind = "install"
manifest = "requirements.txt"
command = ["pip{exe}", "install", "-r", "{manifest}"]

[[steps]]
kind = "migrate"
"#,
    )?;
    let mut sequence = sequence_from_plan(&plan)?;
    let err = sequence.execute_all(&mut ctx).await.unwrap_err();

    match err {
        StallbookError::Halted { step, source } => {
            assert_eq!(step, "install");
            assert!(matches!(*source, StallbookError::ManifestMissing { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(runner.calls().is_empty());
    assert!(!dir.path().join(".stallbook/stallbook.db").exists());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_database_halts_at_checkpoint() -> Result<()> {
    let dir = prepare_workspace();

    // 取得一個確定沒有人在聽的埠
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let database = DatabaseConfig {
        engine: DatabaseEngine::Mysql,
        port: Some(port),
        password: Some("secret".to_string()),
        ..DatabaseConfig::default()
    };
    let mut ctx = context(dir.path(), database, Arc::new(RecordingRunner::default()));

    let plan = BootstrapPlan::from_str(
        r#"
[sequence]
name = "server-db"

[[steps]]
kind = "checkpoint"
timeout_seconds = 1

[[steps]]
kind = "command"
name = "migrate"
program = "python"
args = ["manage.py", "migrate"]
"#,
    )?;
    let mut sequence = sequence_from_plan(&plan)?;
    let err = sequence.execute_all(&mut ctx).await.unwrap_err();

    assert!(matches!(
        sequence.state(),
        BootstrapState::Halted { step, .. } if step == "checkpoint"
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(ctx.get_result_by_name("migrate").is_none());
    Ok(())
}

#[tokio::test]
async fn test_activation_failure_is_fatal() -> Result<()> {
    let dir = prepare_workspace();
    let runner = Arc::new(RecordingRunner::default());
    let mut ctx = context(dir.path(), DatabaseConfig::default(), runner.clone());

    let plan = BootstrapPlan::from_str(
        r#"
[sequence]
name = "no-env"

[[steps]]
kind = "activate"
dir = "venv"

[[steps]]
kind = "command"
program = "pip"
args = ["--version"]
"#,
    )?;
    let mut sequence = sequence_from_plan(&plan)?;
    let err = sequence.execute_all(&mut ctx).await.unwrap_err();

    match err {
        StallbookError::Halted { step, source } => {
            assert_eq!(step, "activate");
            assert!(matches!(*source, StallbookError::ActivationFailed { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(runner.calls().is_empty());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_environment_resolves_programs() -> Result<()> {
    let dir = prepare_workspace();
    let runner = Arc::new(RecordingRunner {
        calls: Mutex::new(Vec::new()),
        // 模擬 `python -m venv`：建立 bin/python
        side_effect: Some(Box::new(|invocation: &Invocation| {
            if invocation.args.first().map(String::as_str) == Some("-m") {
                let bin = Path::new(&invocation.args[2]).join("bin");
                std::fs::create_dir_all(&bin).unwrap();
                std::fs::write(bin.join("python"), "").unwrap();
            }
        })),
    });
    let mut ctx = context(dir.path(), DatabaseConfig::default(), runner.clone());

    let plan = BootstrapPlan::from_str(
        r#"
[sequence]
name = "python-env"

[[steps]]
kind = "create-env"
dir = "venv"
command = ["python", "-m", "venv", "{env}"]

[[steps]]
kind = "activate"
dir = "venv"
variable = "VIRTUAL_ENV"

[[steps]]
kind = "command"
name = "check"
program = "python"
args = ["manage.py", "check"]
"#,
    )?;
    let mut sequence = sequence_from_plan(&plan)?;
    sequence.execute_all(&mut ctx).await?;

    let venv = dir.path().join("venv");
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].program, "python");
    assert_eq!(calls[0].args[2], venv.display().to_string());
    assert_eq!(calls[1].program, venv.join("bin/python").display().to_string());
    assert_eq!(calls[1].env["VIRTUAL_ENV"], venv.display().to_string());
    assert!(calls[1].env["PATH"].starts_with(&venv.join("bin").display().to_string()));
    Ok(())
}

#[test]
fn test_invalid_plan_is_rejected_before_running() {
    let plan = BootstrapPlan::from_str(
        r#"
[sequence]
name = "bad-order"

[[steps]]
kind = "create-env"

[[steps]]
kind = "command"
program = "pip"
"#,
    )
    .unwrap();
    assert!(sequence_from_plan(&plan).is_err());
}
