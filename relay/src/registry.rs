//! Athlete registry: maps `device_id` → athlete identity.
//!
//! The table is copy-on-write: readers take a cheap `Arc` snapshot and never
//! observe a partially applied reload. `PUT /api/athletes` swaps the whole
//! table atomically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Immutable record for a registered athlete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteRecord {
    pub device_id: u32,
    pub athlete_id: String,
    pub name: String,
    pub team: String,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    athletes: Vec<AthleteRecord>,
}

type Table = HashMap<u32, AthleteRecord>;

/// In-memory athlete registry backed by a JSON config file.
pub struct AthleteRegistry {
    table: RwLock<Arc<Table>>,
}

impl AthleteRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(Table::new())),
        }
    }

    /// Load the registry from `athletes.json`. Any failure here is a startup
    /// failure: serving made-up identities for registered devices is worse
    /// than refusing to start.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading athlete registry {}", path.display()))?;
        let parsed: RegistryFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing athlete registry {}", path.display()))?;
        let count = parsed.athletes.len();
        self.replace(parsed.athletes).await;
        info!("Loaded {count} athletes from {}", path.display());
        Ok(count)
    }

    /// Atomically replace the whole table.
    pub async fn replace(&self, athletes: Vec<AthleteRecord>) {
        let table: Table = athletes.into_iter().map(|a| (a.device_id, a)).collect();
        *self.table.write().await = Arc::new(table);
    }

    async fn snapshot(&self) -> Arc<Table> {
        self.table.read().await.clone()
    }

    pub async fn get(&self, device_id: u32) -> Option<AthleteRecord> {
        self.snapshot().await.get(&device_id).cloned()
    }

    /// Look up an athlete, synthesizing identity for unregistered devices so
    /// unknown tags are still tracked.
    pub async fn get_or_default(&self, device_id: u32) -> AthleteRecord {
        if let Some(rec) = self.get(device_id).await {
            return rec;
        }
        AthleteRecord {
            device_id,
            athlete_id: format!("T{device_id}"),
            name: format!("Unknown {device_id}"),
            team: "—".to_string(),
        }
    }

    pub async fn count(&self) -> usize {
        self.snapshot().await.len()
    }

    /// All registered athletes sorted by device id.
    pub async fn all(&self) -> Vec<AthleteRecord> {
        let mut out: Vec<_> = self.snapshot().await.values().cloned().collect();
        out.sort_by_key(|a| a.device_id);
        out
    }
}

impl Default for AthleteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Vec<AthleteRecord> {
        vec![
            AthleteRecord {
                device_id: 1,
                athlete_id: "T1".into(),
                name: "CHAN SIU MING".into(),
                team: "HKG".into(),
            },
            AthleteRecord {
                device_id: 2,
                athlete_id: "T2".into(),
                name: "WONG KA HO".into(),
                team: "HKG".into(),
            },
        ]
    }

    #[tokio::test]
    async fn lookup_and_synthetic_fallback() {
        let reg = AthleteRegistry::new();
        reg.replace(sample()).await;

        assert_eq!(reg.get_or_default(1).await.name, "CHAN SIU MING");

        let unknown = reg.get_or_default(7).await;
        assert_eq!(unknown.athlete_id, "T7");
        assert_eq!(unknown.name, "Unknown 7");
        assert_eq!(unknown.team, "—");
    }

    #[tokio::test]
    async fn replace_is_wholesale() {
        let reg = AthleteRegistry::new();
        reg.replace(sample()).await;
        assert_eq!(reg.count().await, 2);

        reg.replace(vec![AthleteRecord {
            device_id: 9,
            athlete_id: "T9".into(),
            name: "LEE SONGHA".into(),
            team: "HKG".into(),
        }])
        .await;

        assert_eq!(reg.count().await, 1);
        assert!(reg.get(1).await.is_none());
        assert_eq!(reg.get_or_default(9).await.name, "LEE SONGHA");
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("athletes.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"athletes":[{{"device_id":1,"athlete_id":"T1","name":"CHAN SIU MING","team":"HKG"}}]}}"#
        )
        .unwrap();

        let reg = AthleteRegistry::new();
        assert_eq!(reg.load(&path).await.unwrap(), 1);
        assert_eq!(reg.count().await, 1);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let reg = AthleteRegistry::new();
        assert!(reg.load(Path::new("/nonexistent/athletes.json")).await.is_err());
    }
}
