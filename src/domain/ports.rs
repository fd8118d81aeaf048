use crate::core::bootstrap::StepContext;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A fully resolved external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 外部行程執行介面，測試時以記錄用的假物件取代
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion and returns the exit code (`None` when killed by a signal).
    /// A program that cannot be found is reported as `ToolNotFound`.
    async fn run(&self, invocation: &Invocation) -> Result<Option<i32>>;
}

#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Blocks until the operator acknowledges `message`.
    async fn confirm(&self, message: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub summary: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StepOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// 啟動序列中的單一步驟
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, context: &mut StepContext) -> Result<StepOutput>;
}
