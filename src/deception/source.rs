use crate::error::SourceError;
use async_trait::async_trait;
use log::{debug, info};
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// Flux d'événements de l'environnement leurre, en lecture seule
#[async_trait]
pub trait DeceptionSource: Send + Sync {
    /// Lignes complètes ajoutées depuis le dernier appel
    async fn read_new(&self) -> Result<Vec<String>, SourceError>;
}

/// Suit la fin d'un journal en ajout seul
///
/// Une ligne incomplète reste en attente jusqu'à la lecture suivante. Un
/// fichier tronqué ou remplacé est relu depuis le début.
pub struct JsonLogTail {
    path: PathBuf,
    offset: Mutex<u64>,
}

impl JsonLogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl DeceptionSource for JsonLogTail {
    async fn read_new(&self) -> Result<Vec<String>, SourceError> {
        let mut offset = self.offset.lock().await;

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Journal leurre {} absent", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() < *offset {
            info!("Journal leurre {} tronqué, relecture depuis le début", self.path.display());
            *offset = 0;
        }
        if metadata.len() == *offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(*offset)).await?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await?;

        let complete = match buffer.iter().rposition(|&b| b == b'\n') {
            Some(position) => position + 1,
            None => return Ok(Vec::new()),
        };
        *offset += complete as u64;

        Ok(String::from_utf8_lossy(&buffer[..complete])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_tail_reads_only_new_complete_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cowrie.json");
        let tail = JsonLogTail::new(&path);
        assert!(tail.read_new().await.unwrap().is_empty());

        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{{\"a\":1}}\n{{\"b\"").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["{\"a\":1}".to_string()]);

        write!(file, ":2}}\n").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["{\"b\":2}".to_string()]);
        assert!(tail.read_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tail_restarts_after_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cowrie.json");
        std::fs::write(&path, "ligne une assez longue\nligne deux\n").unwrap();
        let tail = JsonLogTail::new(&path);
        assert_eq!(tail.read_new().await.unwrap().len(), 2);

        std::fs::write(&path, "neuve\n").unwrap();
        assert_eq!(tail.read_new().await.unwrap(), vec!["neuve".to_string()]);
    }
}
