use crate::config::substitute_env_vars;
use crate::utils::error::{Result, StallbookError};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_PLAN_FILE: &str = "bootstrap.toml";
pub const DEFAULT_ENV_DIR: &str = ".stallbook";
pub const DEFAULT_ENV_VARIABLE: &str = "STALLBOOK_ENV";
pub const DEFAULT_FIXTURE: &str = "fixtures/sample_data.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapPlan {
    pub sequence: SequenceInfo,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceInfo {
    pub name: String,
    pub description: Option<String>,
}

fn default_env_dir() -> String {
    DEFAULT_ENV_DIR.to_string()
}

fn default_env_variable() -> String {
    DEFAULT_ENV_VARIABLE.to_string()
}

fn default_timeout_seconds() -> u64 {
    5
}

/// 啟動計畫中的步驟定義，以 `kind` 區分
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepDefinition {
    CreateEnv {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_env_dir")]
        dir: String,
        /// External creator, e.g. `["python", "-m", "venv", "{env}"]`.
        #[serde(default)]
        command: Option<Vec<String>>,
    },
    Activate {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_env_dir")]
        dir: String,
        #[serde(default = "default_env_variable")]
        variable: String,
    },
    Install {
        #[serde(default)]
        name: Option<String>,
        manifest: String,
        command: Vec<String>,
    },
    Checkpoint {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        confirm: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },
    Migrate {
        #[serde(default)]
        name: Option<String>,
    },
    LoadFixture {
        #[serde(default)]
        name: Option<String>,
        path: String,
    },
    Command {
        #[serde(default)]
        name: Option<String>,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl StepDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            StepDefinition::CreateEnv { .. } => "create-env",
            StepDefinition::Activate { .. } => "activate",
            StepDefinition::Install { .. } => "install",
            StepDefinition::Checkpoint { .. } => "checkpoint",
            StepDefinition::Migrate { .. } => "migrate",
            StepDefinition::LoadFixture { .. } => "load-fixture",
            StepDefinition::Command { .. } => "command",
        }
    }

    /// Display name: the explicit `name`, or the kind.
    pub fn label(&self) -> String {
        let explicit = match self {
            StepDefinition::CreateEnv { name, .. }
            | StepDefinition::Activate { name, .. }
            | StepDefinition::Install { name, .. }
            | StepDefinition::Checkpoint { name, .. }
            | StepDefinition::Migrate { name }
            | StepDefinition::LoadFixture { name, .. }
            | StepDefinition::Command { name, .. } => name,
        };
        explicit.clone().unwrap_or_else(|| self.kind().to_string())
    }

    /// Steps that launch external programs and must see the activated environment.
    fn runs_external(&self) -> bool {
        matches!(
            self,
            StepDefinition::Install { .. } | StepDefinition::Command { .. }
        )
    }
}

impl BootstrapPlan {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        toml::from_str(&processed).map_err(|e| StallbookError::ConfigError {
            message: format!("Bootstrap plan TOML parsing error: {}", e),
        })
    }

    /// Explicit path, else `bootstrap.toml` in `base_dir`, else the built-in plan.
    pub fn resolve(explicit: Option<&Path>, base_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            tracing::info!("📁 Loading bootstrap plan from {}", path.display());
            return Self::from_file(path);
        }
        let candidate = base_dir.join(DEFAULT_PLAN_FILE);
        if candidate.exists() {
            tracing::info!("📁 Loading bootstrap plan from {}", candidate.display());
            Self::from_file(candidate)
        } else {
            tracing::info!("📁 No {} found, using built-in plan", DEFAULT_PLAN_FILE);
            Ok(Self::default_plan())
        }
    }

    /// Built-in plan used when no `bootstrap.toml` exists. It has no install
    /// step: the binary already carries its dependencies and no manifest can
    /// be assumed in the working directory. Plans that need one declare it.
    pub fn default_plan() -> Self {
        Self {
            sequence: SequenceInfo {
                name: "stallbook-bootstrap".to_string(),
                description: Some("Prepare a local stallbook instance".to_string()),
            },
            steps: vec![
                StepDefinition::CreateEnv {
                    name: None,
                    dir: default_env_dir(),
                    command: None,
                },
                StepDefinition::Activate {
                    name: None,
                    dir: default_env_dir(),
                    variable: default_env_variable(),
                },
                StepDefinition::Checkpoint {
                    name: None,
                    confirm: false,
                    message: None,
                    timeout_seconds: default_timeout_seconds(),
                },
                StepDefinition::Migrate { name: None },
                StepDefinition::LoadFixture {
                    name: None,
                    path: DEFAULT_FIXTURE.to_string(),
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_non_empty_string("sequence.name", &self.sequence.name)?;

        if self.steps.is_empty() {
            return Err(StallbookError::ConfigError {
                message: "Bootstrap plan has no steps".to_string(),
            });
        }

        let mut labels = HashSet::new();
        for step in &self.steps {
            let label = step.label();
            if !labels.insert(label.clone()) {
                return Err(StallbookError::ConfigError {
                    message: format!(
                        "Duplicate step name '{}'; give repeated kinds an explicit name",
                        label
                    ),
                });
            }
            self.validate_step(step)?;
        }

        self.validate_ordering()
    }

    fn validate_step(&self, step: &StepDefinition) -> Result<()> {
        let field = |suffix: &str| format!("steps.{}.{}", step.label(), suffix);
        match step {
            StepDefinition::CreateEnv { dir, command, .. } => {
                validation::validate_path(&field("dir"), dir)?;
                if let Some(command) = command {
                    validate_command(&field("command"), command)?;
                }
            }
            StepDefinition::Activate { dir, variable, .. } => {
                validation::validate_path(&field("dir"), dir)?;
                validation::validate_non_empty_string(&field("variable"), variable)?;
            }
            StepDefinition::Install {
                manifest, command, ..
            } => {
                validation::validate_path(&field("manifest"), manifest)?;
                validate_command(&field("command"), command)?;
            }
            StepDefinition::Checkpoint {
                timeout_seconds, ..
            } => {
                validation::validate_positive_number(&field("timeout_seconds"), *timeout_seconds, 1)?;
            }
            StepDefinition::Migrate { .. } => {}
            StepDefinition::LoadFixture { path, .. } => {
                validation::validate_path(&field("path"), path)?;
                validation::validate_file_extension(&field("path"), path, &["json"])?;
            }
            StepDefinition::Command { program, .. } => {
                validation::validate_non_empty_string(&field("program"), program)?;
            }
        }
        Ok(())
    }

    /// 建立環境之後，任何外部指令之前必須先啟用環境
    fn validate_ordering(&self) -> Result<()> {
        let mut created = false;
        let mut activated = false;

        for step in &self.steps {
            match step {
                StepDefinition::CreateEnv { .. } => {
                    created = true;
                    activated = false;
                }
                StepDefinition::Activate { .. } => activated = true,
                other if other.runs_external() && created && !activated => {
                    return Err(StallbookError::ConfigError {
                        message: format!(
                            "Step '{}' runs after create-env but before the environment is activated",
                            other.label()
                        ),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn validate_command(field: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) => validation::validate_non_empty_string(field, program),
        None => Err(StallbookError::InvalidConfigValueError {
            field: field.to_string(),
            value: "[]".to_string(),
            reason: "Command cannot be empty".to_string(),
        }),
    }
}

impl Validate for BootstrapPlan {
    fn validate(&self) -> Result<()> {
        self.validate()
    }
}
