use crate::config::bootstrap_plan::{BootstrapPlan, StepDefinition};
use crate::core::bootstrap::{ActivatedEnv, BootstrapSequence, StepContext};
use crate::core::probe;
use crate::domain::ports::{Step, StepOutput};
use crate::store::Store;
use crate::utils::error::{Result, StallbookError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

pub const ENV_MARKER_FILE: &str = "stallbook-env.cfg";

/// 建立隔離環境：有設定外部指令就執行它，否則在程序內建立目錄
pub struct CreateEnvStep {
    name: String,
    dir: String,
    command: Option<Vec<String>>,
}

#[async_trait]
impl Step for CreateEnvStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        let root = context.resolve_path(&self.dir);
        context.env_dir = Some(root.clone());

        match &self.command {
            Some(command) => {
                let (program, args) = split_command(command)?;
                let invocation = context.invocation(program, args);
                context.run_checked(&invocation).await?;
                if !root.is_dir() {
                    return Err(StallbookError::PreconditionFailed {
                        check: "create-env".to_string(),
                        reason: format!(
                            "'{}' exited successfully but {} was not created",
                            invocation.program,
                            root.display()
                        ),
                    });
                }
                Ok(StepOutput::new(format!("created {}", root.display()))
                    .with_metadata("env", json!(root.display().to_string()))
                    .with_metadata("external", json!(true)))
            }
            None => {
                let marker = root.join(ENV_MARKER_FILE);
                let existed = marker.is_file();
                std::fs::create_dir_all(context.platform.env_bin_dir(&root))?;
                if existed {
                    tracing::info!("♻️ Reusing environment at {}", root.display());
                } else {
                    std::fs::write(
                        &marker,
                        format!(
                            "platform = {}\ncreated_at = {}\n",
                            context.platform.name(),
                            Utc::now().to_rfc3339()
                        ),
                    )?;
                    tracing::info!("📦 Created environment at {}", root.display());
                }
                Ok(StepOutput::new(format!("environment ready at {}", root.display()))
                    .with_metadata("env", json!(root.display().to_string()))
                    .with_metadata("reused", json!(existed)))
            }
        }
    }
}

/// 啟用失敗即停止，後續步驟不會在錯誤的環境中執行
pub struct ActivateStep {
    name: String,
    dir: String,
    variable: String,
}

#[async_trait]
impl Step for ActivateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        let root = context.resolve_path(&self.dir);
        let bin_dir = context.platform.env_bin_dir(&root);

        if !root.is_dir() {
            return Err(StallbookError::ActivationFailed {
                path: root.display().to_string(),
                reason: "environment directory does not exist".to_string(),
            });
        }
        if !bin_dir.is_dir() {
            return Err(StallbookError::ActivationFailed {
                path: root.display().to_string(),
                reason: format!(
                    "missing '{}' directory for {}",
                    context.platform.bin_dir_name(),
                    context.platform.name()
                ),
            });
        }

        context.env_dir = Some(root.clone());
        context.activate(ActivatedEnv {
            root: root.clone(),
            bin_dir: bin_dir.clone(),
            variable: self.variable.clone(),
        });
        tracing::info!("🔓 Activated environment {}", root.display());

        Ok(StepOutput::new(format!("activated {}", root.display()))
            .with_metadata("bin_dir", json!(bin_dir.display().to_string())))
    }
}

pub struct InstallStep {
    name: String,
    manifest: String,
    command: Vec<String>,
}

#[async_trait]
impl Step for InstallStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        let manifest = context.resolve_path(&self.manifest);
        if !manifest.is_file() {
            return Err(StallbookError::ManifestMissing {
                path: manifest.display().to_string(),
            });
        }
        context.manifest = Some(manifest.clone());

        let (program, args) = split_command(&self.command)?;
        let invocation = context.invocation(program, args);
        context.run_checked(&invocation).await?;

        Ok(StepOutput::new(format!("installed from {}", manifest.display()))
            .with_metadata("manifest", json!(manifest.display().to_string())))
    }
}

/// Confirms the database precondition instead of trusting that it was met.
pub struct CheckpointStep {
    name: String,
    confirm: bool,
    message: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl Step for CheckpointStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        if self.confirm {
            let db = &context.database;
            let message = self.message.clone().unwrap_or_else(|| {
                format!(
                    "Make sure the {:?} database '{}' exists and user '{}' can reach it.",
                    db.engine, db.name, db.user
                )
            });
            context.prompt.confirm(&message).await?;
        }

        let report = probe::check_database(&context.database, &context.working_dir, self.timeout).await?;
        tracing::info!("🟢 Database precondition met: {}", report.target);

        Ok(StepOutput::new(format!("database reachable at {}", report.target))
            .with_metadata("engine", json!(format!("{:?}", report.engine).to_lowercase()))
            .with_metadata("target", json!(report.target)))
    }
}

/// 先列出待套用的 migration，再套用
pub struct MigrateStep {
    name: String,
}

#[async_trait]
impl Step for MigrateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        if context.database.engine.is_server() {
            return Err(StallbookError::config(format!(
                "in-process migrate only supports sqlite; use command steps for {:?}",
                context.database.engine
            )));
        }

        let mut store = Store::open(context.store_path())?;
        let planned: Vec<String> = store
            .pending_migrations()?
            .iter()
            .map(|m| format!("{:04}_{}", m.version, m.name))
            .collect();
        tracing::info!("📋 {} pending migration(s): {:?}", planned.len(), planned);

        let applied = store.migrate()?;
        let summary = if applied.is_empty() {
            "schema already up to date".to_string()
        } else {
            format!("applied {} migration(s)", applied.len())
        };

        Ok(StepOutput::new(summary)
            .with_metadata("planned", json!(planned))
            .with_metadata("applied", json!(applied.len())))
    }
}

pub struct LoadFixtureStep {
    name: String,
    path: String,
}

#[async_trait]
impl Step for LoadFixtureStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        let path = context.resolve_path(&self.path);
        context.fixture = path.clone();

        let mut store = Store::open(context.store_path())?;
        let pending = store.pending_migrations()?;
        if !pending.is_empty() {
            return Err(StallbookError::PreconditionFailed {
                check: "schema".to_string(),
                reason: format!("{} migration(s) pending; run migrate first", pending.len()),
            });
        }

        let report = store.load_fixture(&path)?;
        tracing::info!("🌱 Loaded {} fixture records from {}", report.total, path.display());

        Ok(StepOutput::new(format!("loaded {} records", report.total))
            .with_metadata("fixture", json!(path.display().to_string()))
            .with_metadata("per_model", json!(report.per_model)))
    }
}

pub struct CommandStep {
    name: String,
    program: String,
    args: Vec<String>,
}

#[async_trait]
impl Step for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput> {
        let invocation = context.invocation(&self.program, &self.args);
        context.run_checked(&invocation).await?;
        Ok(StepOutput::new(format!("ran {}", invocation.display())))
    }
}

fn split_command(command: &[String]) -> Result<(&str, &[String])> {
    command
        .split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| StallbookError::config("command cannot be empty"))
}

pub fn step_from_definition(definition: &StepDefinition) -> Box<dyn Step> {
    let name = definition.label();
    match definition {
        StepDefinition::CreateEnv { dir, command, .. } => Box::new(CreateEnvStep {
            name,
            dir: dir.clone(),
            command: command.clone(),
        }),
        StepDefinition::Activate { dir, variable, .. } => Box::new(ActivateStep {
            name,
            dir: dir.clone(),
            variable: variable.clone(),
        }),
        StepDefinition::Install {
            manifest, command, ..
        } => Box::new(InstallStep {
            name,
            manifest: manifest.clone(),
            command: command.clone(),
        }),
        StepDefinition::Checkpoint {
            confirm,
            message,
            timeout_seconds,
            ..
        } => Box::new(CheckpointStep {
            name,
            confirm: *confirm,
            message: message.clone(),
            timeout: Duration::from_secs(*timeout_seconds),
        }),
        StepDefinition::Migrate { .. } => Box::new(MigrateStep { name }),
        StepDefinition::LoadFixture { path, .. } => Box::new(LoadFixtureStep {
            name,
            path: path.clone(),
        }),
        StepDefinition::Command { program, args, .. } => Box::new(CommandStep {
            name,
            program: program.clone(),
            args: args.clone(),
        }),
    }
}

/// Validates the plan and turns it into an executable sequence.
pub fn sequence_from_plan(plan: &BootstrapPlan) -> Result<BootstrapSequence> {
    plan.validate()?;
    let mut sequence = BootstrapSequence::new(plan.sequence.name.clone());
    for definition in &plan.steps {
        sequence.add_step(step_from_definition(definition));
    }
    Ok(sequence)
}
