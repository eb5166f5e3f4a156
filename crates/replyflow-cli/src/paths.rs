use anyhow::Result;
use std::path::PathBuf;

const REPLYFLOW_DIR: &str = ".replyflow";
const LOGS_DIR: &str = "logs";

/// Environment variable to override the ReplyFlow directory.
const REPLYFLOW_DIR_ENV: &str = "REPLYFLOW_DIR";

/// Priority: REPLYFLOW_DIR env var > ~/.replyflow/
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(REPLYFLOW_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(REPLYFLOW_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = resolve_data_dir()?.join(LOGS_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
