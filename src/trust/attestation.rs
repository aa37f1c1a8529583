use super::TrustScoreEngine;
use crate::analyzer::AlertLog;
use crate::identity::{CredentialStatus, DeviceDirectory};
use crate::models::{AlertKind, AnomalyAlert, DeviceId, Severity};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::timeout;

/// Résultats d'attestation conservés par équipement
const ATTESTATION_HISTORY: usize = 50;

/// Résultat d'une attestation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationOutcome {
    Passed,
    CredentialExpired,
    CredentialRevoked,
    /// Aucune activité observée pendant la période de grâce
    NoRecentActivity,
    /// Collaborateur d'identité indisponible, l'équipement n'est pas pénalisé
    Skipped,
}

impl AttestationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttestationOutcome::CredentialExpired
                | AttestationOutcome::CredentialRevoked
                | AttestationOutcome::NoRecentActivity
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            AttestationOutcome::Passed => "attestation réussie",
            AttestationOutcome::CredentialExpired => "certificat expiré",
            AttestationOutcome::CredentialRevoked => "certificat révoqué",
            AttestationOutcome::NoRecentActivity => "aucune activité récente",
            AttestationOutcome::Skipped => "attestation reportée",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttestationRecord {
    pub outcome: AttestationOutcome,
    pub timestamp: SystemTime,
}

/// Revalide périodiquement le certificat et la présence de chaque équipement
pub struct AttestationScheduler {
    directory: Arc<DeviceDirectory>,
    trust: Arc<TrustScoreEngine>,
    alerts: Arc<AlertLog>,
    grace: Duration,
    call_timeout: Duration,
    history: DashMap<DeviceId, VecDeque<AttestationRecord>>,
}

impl AttestationScheduler {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        trust: Arc<TrustScoreEngine>,
        alerts: Arc<AlertLog>,
        grace: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            trust,
            alerts,
            grace,
            call_timeout,
            history: DashMap::new(),
        }
    }

    /// Vérifie un équipement sans appliquer le résultat
    pub async fn check(&self, device_id: &DeviceId) -> AttestationOutcome {
        let provider = self.directory.provider();
        let status = match timeout(self.call_timeout, provider.credential_status(device_id)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("État du certificat de {} indisponible: {}", device_id, e);
                return AttestationOutcome::Skipped;
            }
            Err(_) => {
                warn!("Délai dépassé lors de la vérification du certificat de {}", device_id);
                return AttestationOutcome::Skipped;
            }
        };

        match status {
            CredentialStatus::Expired => return AttestationOutcome::CredentialExpired,
            CredentialStatus::Revoked => return AttestationOutcome::CredentialRevoked,
            CredentialStatus::Valid => {}
        }

        let alive = match self.directory.last_activity(device_id) {
            // Horodatage dans le futur : horloge décalée, pas une absence
            Some(at) => SystemTime::now()
                .duration_since(at)
                .map(|age| age <= self.grace)
                .unwrap_or(true),
            None => false,
        };

        if alive {
            AttestationOutcome::Passed
        } else {
            AttestationOutcome::NoRecentActivity
        }
    }

    /// Atteste un équipement et transmet le résultat au moteur de confiance
    pub async fn attest(&self, device_id: &DeviceId) -> AttestationOutcome {
        let outcome = self.check(device_id).await;

        if outcome.is_failure() {
            warn!("Échec d'attestation pour {}: {}", device_id, outcome.describe());
            self.alerts.push(AnomalyAlert {
                device_id: device_id.clone(),
                kind: AlertKind::AttestationFailure,
                severity: Severity::Medium,
                ratio: 0.0,
                indicators: vec![outcome.describe().to_string()],
                timestamp: SystemTime::now(),
            });
            self.trust
                .record_attestation_failure(device_id, outcome.describe())
                .await;
        } else if outcome == AttestationOutcome::Passed {
            debug!("Attestation réussie pour {}", device_id);
            self.trust.record_attestation_pass(device_id).await;
        }

        self.remember(device_id, outcome.clone());
        outcome
    }

    /// Atteste tous les équipements enrôlés, renvoie (réussites, échecs)
    ///
    /// Le cycle s'interrompt entre deux équipements dès que `stop` passe à vrai.
    pub async fn run_cycle(&self, stop: &watch::Receiver<bool>) -> (usize, usize) {
        let mut passed = 0;
        let mut failed = 0;
        for device_id in self.directory.roster().await {
            if *stop.borrow() {
                debug!("Cycle d'attestation interrompu avant {}", device_id);
                break;
            }
            match self.attest(&device_id).await {
                AttestationOutcome::Passed => passed += 1,
                outcome if outcome.is_failure() => failed += 1,
                _ => {}
            }
        }
        info!("Cycle d'attestation terminé: {} réussite(s), {} échec(s)", passed, failed);
        (passed, failed)
    }

    pub fn history(&self, device_id: &DeviceId) -> Vec<AttestationRecord> {
        self.history
            .get(device_id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remember(&self, device_id: &DeviceId, outcome: AttestationOutcome) {
        let mut records = self.history.entry(device_id.clone()).or_default();
        records.push_back(AttestationRecord {
            outcome,
            timestamp: SystemTime::now(),
        });
        while records.len() > ATTESTATION_HISTORY {
            records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{InventoryEntry, StaticInventory};
    use crate::logger::EventJournal;
    use crate::models::{Device, DeviceStatus};
    use crate::trust::{JsonTrustStore, TrustSettings};
    use pnet::util::MacAddr;
    use tempfile::tempdir;

    fn inventory(credential: CredentialStatus) -> Arc<StaticInventory> {
        Arc::new(StaticInventory::new(vec![InventoryEntry {
            device: Device {
                id: DeviceId::from("lock-1"),
                mac: MacAddr::new(0xaa, 0, 0, 0, 0, 2),
                ip: None,
                status: DeviceStatus::Active,
            },
            credential,
        }]))
    }

    fn scheduler(inventory: Arc<StaticInventory>, dir: &std::path::Path, grace: Duration) -> (AttestationScheduler, Arc<TrustScoreEngine>, Arc<DeviceDirectory>) {
        let directory = Arc::new(DeviceDirectory::new(inventory, Duration::from_secs(1)));
        let trust = Arc::new(TrustScoreEngine::new(
            TrustSettings::default(),
            Arc::new(JsonTrustStore::new(dir)),
            Arc::new(EventJournal::log_only()),
        ));
        let scheduler = AttestationScheduler::new(
            directory.clone(),
            trust.clone(),
            Arc::new(AlertLog::new(10)),
            grace,
            Duration::from_secs(1),
        );
        (scheduler, trust, directory)
    }

    #[tokio::test]
    async fn test_revoked_credential_fails() {
        let dir = tempdir().unwrap();
        let (scheduler, trust, _) = scheduler(inventory(CredentialStatus::Revoked), dir.path(), Duration::from_secs(600));
        let id = DeviceId::from("lock-1");

        assert_eq!(scheduler.attest(&id).await, AttestationOutcome::CredentialRevoked);
        assert_eq!(trust.score(&id), Some(50));
        assert_eq!(scheduler.history(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_window() {
        let dir = tempdir().unwrap();
        let (scheduler, trust, directory) = scheduler(inventory(CredentialStatus::Valid), dir.path(), Duration::from_secs(600));
        let id = DeviceId::from("lock-1");

        // Jamais vu : pas d'activité connue
        assert_eq!(scheduler.attest(&id).await, AttestationOutcome::NoRecentActivity);

        directory.mark_active(&id, SystemTime::now() - Duration::from_secs(60));
        assert_eq!(scheduler.attest(&id).await, AttestationOutcome::Passed);

        directory.mark_active(&id, SystemTime::now() - Duration::from_secs(3600));
        assert_eq!(scheduler.attest(&id).await, AttestationOutcome::NoRecentActivity);
        assert_eq!(trust.score(&id), Some(30));
    }

    #[tokio::test]
    async fn test_cycle_stops_when_requested() {
        let dir = tempdir().unwrap();
        let (scheduler, trust, _) = scheduler(inventory(CredentialStatus::Revoked), dir.path(), Duration::from_secs(600));
        let (stop, receiver) = watch::channel(false);

        assert_eq!(scheduler.run_cycle(&receiver).await, (0, 1));

        stop.send_replace(true);
        assert_eq!(scheduler.run_cycle(&receiver).await, (0, 0));
        assert_eq!(trust.score(&DeviceId::from("lock-1")), Some(50));
    }
}
