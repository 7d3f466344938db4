use crate::agent::{Agent, AgentOutput, AgentRequest};
use async_trait::async_trait;
use chrono::Utc;
use paperflow_core::AgentError;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes a workflow's upstream outputs as one JSON document per run.
pub struct FileStoreAgent {
    dir: PathBuf,
}

impl FileStoreAgent {
    /// A store writing into `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory results are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Agent for FileStoreAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let path = self.dir.join(format!("{}.json", request.correlation_id));
        let document = json!({
            "correlation_id": request.correlation_id,
            "task_id": request.task_id,
            "user_id": request.user_id,
            "stored_at": Utc::now(),
            "input": request.input,
            "results": request.upstream,
        });
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| AgentError::permanent(format!("cannot encode results: {e}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::transient(format!("cannot create {}: {e}", self.dir.display())))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AgentError::transient(format!("cannot write {}: {e}", path.display())))?;

        info!(path = %path.display(), "Stored workflow results");
        Ok(AgentOutput::new(json!({ "path": path.display().to_string() })))
    }
}
