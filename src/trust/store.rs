use crate::error::PersistenceError;
use crate::models::{DeviceId, TrustHistoryEntry, TrustScoreRecord};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// État persistant d'un équipement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTrust {
    pub record: TrustScoreRecord,
    pub history: Vec<TrustHistoryEntry>,
    /// Remontée par bon comportement plafonnée jusqu'à la prochaine attestation réussie
    #[serde(default)]
    pub recovery_locked: bool,
}

/// Stockage des scores de confiance
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn load(&self, device_id: &DeviceId) -> Result<Option<PersistedTrust>, PersistenceError>;

    async fn load_all(&self) -> Result<Vec<PersistedTrust>, PersistenceError>;

    async fn save(&self, state: &PersistedTrust) -> Result<(), PersistenceError>;
}

/// Un fichier JSON par équipement dans un répertoire
///
/// L'écriture passe par un fichier temporaire renommé pour ne jamais laisser
/// un état à moitié écrit.
pub struct JsonTrustStore {
    dir: PathBuf,
}

impl JsonTrustStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Nom de fichier en hexadécimal : deux identifiants distincts ne
    /// partagent jamais le même fichier
    fn path_for(&self, device_id: &DeviceId) -> PathBuf {
        let name: String = device_id.as_str().bytes().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl TrustStore for JsonTrustStore {
    async fn load(&self, device_id: &DeviceId) -> Result<Option<PersistedTrust>, PersistenceError> {
        let path = self.path_for(device_id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<PersistedTrust>, PersistenceError> {
        let mut states = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(states),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<PersistedTrust>(&content) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Fichier de score illisible {}: {}", path.display(), e),
            }
        }
        Ok(states)
    }

    async fn save(&self, state: &PersistedTrust) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.record.device_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
