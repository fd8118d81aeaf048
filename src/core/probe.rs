use crate::config::{DatabaseConfig, DatabaseEngine};
use crate::utils::error::{Result, StallbookError};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub engine: DatabaseEngine,
    pub target: String,
}

/// Verifies what the operator was previously only asked to set up by hand:
/// credentials resolve and the database endpoint answers.
pub async fn check_database(
    db: &DatabaseConfig,
    base_dir: &Path,
    timeout: Duration,
) -> Result<ProbeReport> {
    if db.engine.is_server() {
        check_credentials(db)?;
        check_endpoint(db, timeout).await
    } else {
        check_store_location(db, base_dir)
    }
}

fn failed(check: &str, reason: impl Into<String>) -> StallbookError {
    StallbookError::PreconditionFailed {
        check: check.to_string(),
        reason: reason.into(),
    }
}

pub fn check_credentials(db: &DatabaseConfig) -> Result<()> {
    if db.name.trim().is_empty() {
        return Err(failed("credentials", "database name is empty"));
    }
    if db.user.trim().is_empty() {
        return Err(failed("credentials", "database user is empty"));
    }
    db.resolve_password()
        .map(|_| ())
        .map_err(|e| failed("credentials", e.to_string()))
}

async fn check_endpoint(db: &DatabaseConfig, timeout: Duration) -> Result<ProbeReport> {
    let port = db
        .effective_port()
        .ok_or_else(|| failed("endpoint", "no port configured"))?;
    let target = format!("{}:{}", db.host, port);

    tracing::info!("🔌 Probing database endpoint {}", target);
    match tokio::time::timeout(timeout, TcpStream::connect((db.host.as_str(), port))).await {
        Ok(Ok(_stream)) => Ok(ProbeReport {
            engine: db.engine,
            target,
        }),
        Ok(Err(e)) => Err(failed("endpoint", format!("{} unreachable: {}", target, e))),
        Err(_) => Err(failed(
            "endpoint",
            format!("{} did not answer within {:?}", target, timeout),
        )),
    }
}

fn check_store_location(db: &DatabaseConfig, base_dir: &Path) -> Result<ProbeReport> {
    let store = base_dir.join(&db.path);
    let parent = store
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(base_dir);

    if !parent.is_dir() {
        return Err(failed(
            "store-location",
            format!("directory {} does not exist", parent.display()),
        ));
    }

    let probe = parent.join(".stallbook-write-probe");
    std::fs::write(&probe, b"probe")
        .map_err(|e| failed("store-location", format!("{} is not writable: {}", parent.display(), e)))?;
    let _ = std::fs::remove_file(&probe);

    Ok(ProbeReport {
        engine: DatabaseEngine::Sqlite,
        target: store.display().to_string(),
    })
}
