use crate::config::bootstrap_plan::DEFAULT_FIXTURE;
use crate::config::DatabaseConfig;
use crate::core::platform::Platform;
use crate::domain::ports::{CommandRunner, Invocation, OperatorPrompt, Step};
use crate::utils::error::{Result, StallbookError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 單一步驟的執行結果
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub summary: String,
    pub duration: Duration,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// 啟動序列狀態：Pending → Running(i) → Completed，或在第一個失敗時 Halted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Pending,
    Running(usize),
    Completed,
    Halted { step: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedEnv {
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    pub variable: String,
}

/// 啟動序列執行上下文，在步驟間傳遞環境與設定
pub struct StepContext {
    pub execution_id: String,
    pub working_dir: PathBuf,
    pub platform: Platform,
    pub database: DatabaseConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub prompt: Arc<dyn OperatorPrompt>,
    pub env_dir: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub fixture: PathBuf,
    pub previous_results: Vec<StepResult>,
    activated: Option<ActivatedEnv>,
    env_overlay: BTreeMap<String, String>,
}

impl StepContext {
    pub fn new(
        execution_id: String,
        working_dir: PathBuf,
        database: DatabaseConfig,
        runner: Arc<dyn CommandRunner>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self {
        let fixture = working_dir.join(DEFAULT_FIXTURE);
        Self {
            execution_id,
            working_dir,
            platform: Platform::current(),
            database,
            runner,
            prompt,
            env_dir: None,
            manifest: None,
            fixture,
            previous_results: Vec::new(),
            activated: None,
            env_overlay: BTreeMap::new(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Plan paths are relative to the working directory and use `/` separators.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let native = self.platform.native_path(raw);
        if native.is_absolute() {
            native
        } else {
            self.working_dir.join(native)
        }
    }

    pub fn activated(&self) -> Option<&ActivatedEnv> {
        self.activated.as_ref()
    }

    /// Later invocations resolve programs from the environment first.
    pub fn activate(&mut self, env: ActivatedEnv) {
        let inherited = std::env::var("PATH").ok();
        let path = self
            .platform
            .prepend_search_path(&env.bin_dir, inherited.as_deref());
        self.env_overlay.insert("PATH".to_string(), path);
        self.env_overlay
            .insert(env.variable.clone(), env.root.display().to_string());
        self.activated = Some(env);
    }

    pub fn env_overlay(&self) -> &BTreeMap<String, String> {
        &self.env_overlay
    }

    pub fn substitute(&self, raw: &str) -> String {
        let env = self
            .env_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let env_bin = self
            .env_dir
            .as_ref()
            .map(|p| self.platform.env_bin_dir(p).display().to_string())
            .unwrap_or_default();
        let manifest = self
            .manifest
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        raw.replace("{env_bin}", &env_bin)
            .replace("{env}", &env)
            .replace("{manifest}", &manifest)
            .replace("{fixture}", &self.fixture.display().to_string())
            .replace("{exe}", self.platform.exe_suffix())
    }

    /// Builds an invocation with placeholders filled in; inside an activated
    /// environment the program is looked up in its bin directory first.
    pub fn invocation(&self, program: &str, args: &[String]) -> Invocation {
        let program = self.substitute(program);
        let program = self
            .activated
            .as_ref()
            .and_then(|env| self.platform.resolve_in(&env.bin_dir, &program))
            .map(|p| p.display().to_string())
            .unwrap_or(program);

        Invocation {
            program,
            args: args.iter().map(|a| self.substitute(a)).collect(),
            env: self.env_overlay.clone(),
            cwd: self.working_dir.clone(),
        }
    }

    /// Runs the invocation and treats anything but exit code 0 as failure.
    pub async fn run_checked(&self, invocation: &Invocation) -> Result<()> {
        tracing::info!("▶️ Running: {}", invocation.display());
        match self.runner.run(invocation).await? {
            Some(0) => Ok(()),
            code => Err(StallbookError::CommandFailed {
                program: invocation.program.clone(),
                code,
            }),
        }
    }

    pub fn get_result_by_name(&self, name: &str) -> Option<&StepResult> {
        self.previous_results.iter().find(|r| r.step_name == name)
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve_path(&self.database.path)
    }
}

/// 啟動序列執行器，依序執行步驟並在第一個失敗時停止
pub struct BootstrapSequence {
    steps: Vec<Box<dyn Step>>,
    execution_id: String,
    state: BootstrapState,
}

impl BootstrapSequence {
    pub fn new(execution_id: String) -> Self {
        Self {
            steps: Vec::new(),
            execution_id,
            state: BootstrapState::Pending,
        }
    }

    pub fn add_step(&mut self, step: Box<dyn Step>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// 執行所有步驟；沒有重試，也沒有從中斷點續跑
    pub async fn execute_all(&mut self, context: &mut StepContext) -> Result<Vec<StepResult>> {
        let total = self.steps.len();
        tracing::info!(
            "🚀 Starting bootstrap '{}' ({} steps)",
            self.execution_id,
            total
        );

        for (index, step) in self.steps.iter().enumerate() {
            self.state = BootstrapState::Running(index);
            tracing::info!("📍 Step {}/{}: {}", index + 1, total, step.name());

            let start_time = Instant::now();
            match step.run(context).await {
                Ok(output) => {
                    let result = StepResult {
                        step_name: step.name().to_string(),
                        summary: output.summary,
                        duration: start_time.elapsed(),
                        metadata: output.metadata,
                    };
                    tracing::info!(
                        "✅ Step completed: {} ({}, {:?})",
                        result.step_name,
                        result.summary,
                        result.duration
                    );
                    context.previous_results.push(result);
                }
                Err(e) => {
                    tracing::error!("❌ Step '{}' failed: {}", step.name(), e);
                    self.state = BootstrapState::Halted {
                        step: step.name().to_string(),
                        reason: e.to_string(),
                    };
                    return Err(StallbookError::Halted {
                        step: step.name().to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        self.state = BootstrapState::Completed;
        tracing::info!("🎉 Bootstrap '{}' completed", self.execution_id);
        Ok(context.previous_results.clone())
    }

    pub fn get_execution_summary(results: &[StepResult]) -> BTreeMap<String, serde_json::Value> {
        let mut summary = BTreeMap::new();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();

        summary.insert("total_steps".to_string(), serde_json::Value::from(results.len()));
        summary.insert(
            "total_duration_ms".to_string(),
            serde_json::Value::from(total_duration.as_millis() as u64),
        );
        summary.insert(
            "executed_steps".to_string(),
            serde_json::Value::Array(
                results
                    .iter()
                    .map(|r| serde_json::Value::String(r.step_name.clone()))
                    .collect(),
            ),
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::AutoConfirm;
    use crate::domain::ports::StepOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ExitCodeRunner {
        code: Option<i32>,
        seen: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl CommandRunner for ExitCodeRunner {
        async fn run(&self, invocation: &Invocation) -> Result<Option<i32>> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(self.code)
        }
    }

    struct FixedStep {
        name: String,
        fail: bool,
    }

    #[async_trait]
    impl Step for FixedStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _context: &mut StepContext) -> Result<StepOutput> {
            if self.fail {
                Err(StallbookError::validation("boom"))
            } else {
                Ok(StepOutput::new("ok"))
            }
        }
    }

    fn context(runner: Arc<dyn CommandRunner>) -> StepContext {
        StepContext::new(
            "test".to_string(),
            PathBuf::from("/work"),
            DatabaseConfig::default(),
            runner,
            Arc::new(AutoConfirm),
        )
        .with_platform(Platform::Unix)
    }

    fn step(name: &str, fail: bool) -> Box<dyn Step> {
        Box::new(FixedStep {
            name: name.to_string(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_sequence_completes() {
        let mut ctx = context(Arc::new(ExitCodeRunner::default()));
        let mut sequence = BootstrapSequence::new("test".to_string());
        sequence.add_step(step("one", false));
        sequence.add_step(step("two", false));
        assert_eq!(sequence.state(), &BootstrapState::Pending);

        let results = sequence.execute_all(&mut ctx).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(sequence.state(), &BootstrapState::Completed);
        assert!(ctx.get_result_by_name("two").is_some());
    }

    #[tokio::test]
    async fn test_sequence_halts_on_first_failure() {
        let mut ctx = context(Arc::new(ExitCodeRunner::default()));
        let mut sequence = BootstrapSequence::new("test".to_string());
        sequence.add_step(step("one", false));
        sequence.add_step(step("two", true));
        sequence.add_step(step("three", false));

        let err = sequence.execute_all(&mut ctx).await.unwrap_err();
        match err {
            StallbookError::Halted { step, .. } => assert_eq!(step, "two"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(sequence.state(), BootstrapState::Halted { step, .. } if step == "two"));
        assert_eq!(ctx.previous_results.len(), 1);
        assert!(ctx.get_result_by_name("three").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_placeholder_substitution() {
        let mut ctx = context(Arc::new(ExitCodeRunner::default()));
        ctx.env_dir = Some(PathBuf::from("/work/venv"));
        ctx.manifest = Some(PathBuf::from("/work/requirements.txt"));

        assert_eq!(ctx.substitute("{env_bin}/pip{exe}"), "/work/venv/bin/pip");
        assert_eq!(ctx.substitute("-r {manifest}"), "-r /work/requirements.txt");
        assert_eq!(ctx.substitute("{env}"), "/work/venv");
    }

    #[test]
    fn test_activation_overlays_path() {
        let mut ctx = context(Arc::new(ExitCodeRunner::default()));
        ctx.activate(ActivatedEnv {
            root: PathBuf::from("/work/venv"),
            bin_dir: PathBuf::from("/work/venv/bin"),
            variable: "VIRTUAL_ENV".to_string(),
        });

        let invocation = ctx.invocation("python", &["--version".to_string()]);
        assert!(invocation.env["PATH"].starts_with("/work/venv/bin"));
        assert_eq!(invocation.env["VIRTUAL_ENV"], "/work/venv");
        assert_eq!(invocation.cwd, PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        let runner = Arc::new(ExitCodeRunner {
            code: Some(2),
            ..Default::default()
        });
        let ctx = context(runner.clone());
        let invocation = ctx.invocation("pip", &[]);
        let err = ctx.run_checked(&invocation).await.unwrap_err();
        assert!(matches!(err, StallbookError::CommandFailed { code: Some(2), .. }));
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_execution_summary() {
        let results = vec![
            StepResult {
                step_name: "create-env".to_string(),
                summary: "ok".to_string(),
                duration: Duration::from_millis(100),
                metadata: BTreeMap::new(),
            },
            StepResult {
                step_name: "migrate".to_string(),
                summary: "ok".to_string(),
                duration: Duration::from_millis(200),
                metadata: BTreeMap::new(),
            },
        ];

        let summary = BootstrapSequence::get_execution_summary(&results);
        assert_eq!(summary["total_steps"], serde_json::Value::from(2));
        assert_eq!(summary["total_duration_ms"], serde_json::Value::from(300));
        assert_eq!(summary["executed_steps"][1], "migrate");
    }
}
