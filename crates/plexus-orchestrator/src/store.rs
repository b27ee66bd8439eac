use crate::cache::Fingerprint;
use crate::types::Plan;
use async_trait::async_trait;
use plexus_core::{PlexusError, PlexusResult};
use std::path::PathBuf;

/// Durable backing for the plan cache, keyed by the same fingerprint.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn load(&self, fingerprint: &Fingerprint) -> PlexusResult<Option<Plan>>;
    async fn save(&self, fingerprint: &Fingerprint, plan: &Plan) -> PlexusResult<()>;
}

/// File-based plan store: one pretty-printed JSON file per fingerprint.
pub struct FilePlanStore {
    dir: PathBuf,
}

impl FilePlanStore {
    pub async fn new(dir: PathBuf) -> PlexusResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn plan_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_str()))
    }

    /// Fingerprints of every stored plan.
    pub async fn list(&self) -> PlexusResult<Vec<Fingerprint>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut fingerprints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    fingerprints.push(Fingerprint::new(stem));
                }
            }
        }
        fingerprints.sort();
        Ok(fingerprints)
    }

    pub async fn delete(&self, fingerprint: &Fingerprint) -> PlexusResult<()> {
        let path = self.plan_path(fingerprint);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn load(&self, fingerprint: &Fingerprint) -> PlexusResult<Option<Plan>> {
        let path = self.plan_path(fingerprint);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let plan: Plan = serde_json::from_str(&data)
            .map_err(|e| PlexusError::Store(format!("Failed to parse plan {fingerprint}: {e}")))?;
        Ok(Some(plan))
    }

    async fn save(&self, fingerprint: &Fingerprint, plan: &Plan) -> PlexusResult<()> {
        let path = self.plan_path(fingerprint);
        let json = serde_json::to_string_pretty(plan)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
