//! Score de confiance par équipement
//!
//! Le score (0-100) évolue par deltas signés : alertes, échecs d'attestation
//! et bon comportement. Chaque changement est appliqué sous le verrou de
//! l'équipement : mise à jour, historique, persistance puis notification des
//! abonnés, avant tout autre événement du même équipement.

pub mod attestation;
pub mod store;

use crate::config::{Config, TrustThresholds};
use crate::logger::EventJournal;
use crate::models::{DeviceId, Severity, TrustHistoryEntry, TrustLevel, TrustScoreRecord};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::timeout;

pub use attestation::{AttestationOutcome, AttestationRecord, AttestationScheduler};
pub use store::{JsonTrustStore, PersistedTrust, TrustStore};

/// Échecs d'écriture consécutifs avant de signaler un état dégradé
const DEGRADED_AFTER_FAILURES: u32 = 3;

pub const GOOD_BEHAVIOR_DELTA: i32 = 2;
pub const ATTESTATION_FAILURE_DELTA: i32 = -20;

/// Changement de score notifié aux abonnés
#[derive(Debug, Clone)]
pub struct TrustChange {
    pub device_id: DeviceId,
    pub old_score: u8,
    pub new_score: u8,
    pub delta: i32,
    pub reason: String,
    pub timestamp: SystemTime,
}

/// Abonné aux changements de score
///
/// L'appel a lieu sous le verrou de l'équipement : l'abonné ne doit pas
/// ajuster le score du même équipement.
#[async_trait]
pub trait TrustSubscriber: Send + Sync {
    async fn on_trust_change(&self, change: &TrustChange);
}

/// Paramètres du moteur de confiance
#[derive(Debug, Clone)]
pub struct TrustSettings {
    pub initial_score: u8,
    pub thresholds: TrustThresholds,
    pub history_limit: usize,
    pub persist_timeout: Duration,
}

impl TrustSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_score: config.initial_trust_score,
            thresholds: config.trust_thresholds,
            history_limit: config.trust_history_limit,
            persist_timeout: config.poll_timeout(),
        }
    }
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Signification d'un score
pub fn trust_level(score: u8, thresholds: &TrustThresholds) -> TrustLevel {
    if score >= thresholds.trusted {
        TrustLevel::Trusted
    } else if score >= thresholds.restricted {
        TrustLevel::Monitored
    } else if score >= thresholds.quarantine {
        TrustLevel::Suspicious
    } else {
        TrustLevel::Untrusted
    }
}

struct DeviceTrust {
    record: TrustScoreRecord,
    history: VecDeque<TrustHistoryEntry>,
    recovery_locked: bool,
    loaded: bool,
}

impl DeviceTrust {
    fn blank(device_id: DeviceId, score: u8) -> Self {
        Self {
            record: TrustScoreRecord {
                device_id,
                score,
                updated_at: SystemTime::now(),
            },
            history: VecDeque::new(),
            recovery_locked: false,
            loaded: false,
        }
    }

    fn restore(state: PersistedTrust) -> Self {
        Self {
            record: state.record,
            history: state.history.into(),
            recovery_locked: state.recovery_locked,
            loaded: true,
        }
    }

    fn to_persisted(&self) -> PersistedTrust {
        PersistedTrust {
            record: self.record.clone(),
            history: self.history.iter().cloned().collect(),
            recovery_locked: self.recovery_locked,
        }
    }
}

pub struct TrustScoreEngine {
    settings: TrustSettings,
    devices: DashMap<DeviceId, Arc<Mutex<DeviceTrust>>>,
    /// Copie lisible sans verrou du score courant
    scores: DashMap<DeviceId, TrustScoreRecord>,
    subscribers: RwLock<Vec<Arc<dyn TrustSubscriber>>>,
    store: Arc<dyn TrustStore>,
    pending: DashSet<DeviceId>,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    journal: Arc<EventJournal>,
}

impl TrustScoreEngine {
    pub fn new(settings: TrustSettings, store: Arc<dyn TrustStore>, journal: Arc<EventJournal>) -> Self {
        Self {
            settings,
            devices: DashMap::new(),
            scores: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            store,
            pending: DashSet::new(),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            journal,
        }
    }

    pub fn thresholds(&self) -> &TrustThresholds {
        &self.settings.thresholds
    }

    pub fn subscribe(&self, subscriber: Arc<dyn TrustSubscriber>) {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(subscriber),
            Err(e) => warn!("Impossible d'enregistrer un abonné: {}", e),
        }
    }

    /// Recharge tous les scores persistés au démarrage
    pub async fn restore_all(&self) -> usize {
        match self.store.load_all().await {
            Ok(states) => {
                let count = states.len();
                for state in states {
                    let id = state.record.device_id.clone();
                    self.scores.insert(id.clone(), state.record.clone());
                    self.devices.insert(id, Arc::new(Mutex::new(DeviceTrust::restore(state))));
                }
                info!("{} score(s) de confiance restauré(s)", count);
                count
            }
            Err(e) => {
                warn!("Impossible de restaurer les scores de confiance: {}", e);
                0
            }
        }
    }

    /// Charge le score persisté ou crée l'équipement avec le score initial
    pub async fn initialize(&self, device_id: &DeviceId) -> u8 {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        self.ensure_loaded(&mut state).await;
        state.record.score
    }

    /// Applique un delta signé et renvoie le nouveau score
    pub async fn adjust(&self, device_id: &DeviceId, delta: i32, reason: &str) -> u8 {
        self.apply(device_id, delta, reason, false).await
    }

    pub async fn record_alert(&self, device_id: &DeviceId, severity: Severity, origin: &str) -> u8 {
        let reason = format!("alerte {} ({})", severity, origin);
        self.apply(device_id, severity.trust_delta(), &reason, false).await
    }

    pub async fn record_attestation_failure(&self, device_id: &DeviceId, cause: &str) -> u8 {
        let reason = format!("échec d'attestation: {}", cause);
        self.apply(device_id, ATTESTATION_FAILURE_DELTA, &reason, false).await
    }

    /// Bonus de bon comportement
    ///
    /// Sous le seuil de quarantaine, le bonus ne peut pas faire repasser le
    /// score au-dessus du seuil avant une attestation réussie.
    pub async fn record_good_behavior(&self, device_id: &DeviceId) -> u8 {
        self.apply(device_id, GOOD_BEHAVIOR_DELTA, "bon comportement", true).await
    }

    /// Attestation réussie : lève le plafond de remontée
    pub async fn record_attestation_pass(&self, device_id: &DeviceId) {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        self.ensure_loaded(&mut state).await;
        if state.recovery_locked {
            state.recovery_locked = false;
            debug!("Plafond de remontée levé pour {}", device_id);
            let snapshot = state.to_persisted();
            self.persist(&snapshot).await;
        }
    }

    async fn apply(&self, device_id: &DeviceId, delta: i32, reason: &str, capped: bool) -> u8 {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        self.ensure_loaded(&mut state).await;

        let quarantine = self.settings.thresholds.quarantine;
        let old = state.record.score;
        let mut new = (old as i32 + delta).clamp(0, 100) as u8;
        if capped && state.recovery_locked && delta > 0 {
            new = new.min(old.max(quarantine.saturating_sub(1)));
        }
        if new < quarantine {
            state.recovery_locked = true;
        }

        let now = SystemTime::now();
        state.record.score = new;
        state.record.updated_at = now;
        state.history.push_back(TrustHistoryEntry {
            score: new,
            delta,
            reason: reason.to_string(),
            timestamp: now,
        });
        while state.history.len() > self.settings.history_limit {
            state.history.pop_front();
        }
        self.scores.insert(device_id.clone(), state.record.clone());
        self.journal.log_trust_change(device_id, old, new, delta, reason);

        let snapshot = state.to_persisted();
        self.persist(&snapshot).await;

        let crossed = self
            .settings
            .thresholds
            .watched()
            .iter()
            .any(|&threshold| (old < threshold) != (new < threshold));
        if crossed || delta.abs() >= 10 {
            self.notify(TrustChange {
                device_id: device_id.clone(),
                old_score: old,
                new_score: new,
                delta,
                reason: reason.to_string(),
                timestamp: now,
            })
            .await;
        }

        new
    }

    /// Renotifie les abonnés avec le score courant, sans le modifier
    ///
    /// La notification a lieu sous le verrou de l'équipement : une décision
    /// prise ici ne peut pas être appliquée après celle d'un changement plus
    /// récent.
    pub async fn reevaluate(&self, device_id: &DeviceId) -> u8 {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        self.ensure_loaded(&mut state).await;

        let score = state.record.score;
        self.notify(TrustChange {
            device_id: device_id.clone(),
            old_score: score,
            new_score: score,
            delta: 0,
            reason: "réévaluation".to_string(),
            timestamp: SystemTime::now(),
        })
        .await;
        score
    }

    async fn notify(&self, change: TrustChange) {
        for subscriber in self.subscribers_snapshot() {
            subscriber.on_trust_change(&change).await;
        }
    }

    fn cell(&self, device_id: &DeviceId) -> Arc<Mutex<DeviceTrust>> {
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceTrust::blank(device_id.clone(), self.settings.initial_score))))
            .clone()
    }

    async fn ensure_loaded(&self, state: &mut DeviceTrust) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        let device_id = state.record.device_id.clone();

        match timeout(self.settings.persist_timeout, self.store.load(&device_id)).await {
            Ok(Ok(Some(persisted))) => {
                *state = DeviceTrust::restore(persisted);
                self.scores.insert(device_id, state.record.clone());
            }
            Ok(Ok(None)) => {
                state.history.push_back(TrustHistoryEntry {
                    score: state.record.score,
                    delta: 0,
                    reason: "initialisation".to_string(),
                    timestamp: state.record.updated_at,
                });
                self.scores.insert(device_id.clone(), state.record.clone());
                info!("Nouvel équipement {} avec un score de {}", device_id, state.record.score);
                let snapshot = state.to_persisted();
                self.persist(&snapshot).await;
            }
            Ok(Err(e)) => {
                warn!("Lecture du score de {} impossible, score initial conservé: {}", device_id, e);
                self.scores.insert(device_id, state.record.clone());
            }
            Err(_) => {
                warn!("Délai dépassé lors de la lecture du score de {}", device_id);
                self.scores.insert(device_id, state.record.clone());
            }
        }
    }

    async fn persist(&self, snapshot: &PersistedTrust) {
        let device_id = &snapshot.record.device_id;
        let result = match timeout(self.settings.persist_timeout, self.store.save(snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::PersistenceError::Timeout(device_id.clone())),
        };

        match result {
            Ok(()) => {
                self.pending.remove(device_id);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if self.pending.is_empty() {
                    self.degraded.store(false, Ordering::SeqCst);
                }
            }
            Err(e) => {
                warn!("Score de {} non persisté, nouvelle tentative plus tard: {}", device_id, e);
                self.pending.insert(device_id.clone());
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= DEGRADED_AFTER_FAILURES && !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!("Persistance des scores dégradée après {} échecs consécutifs", failures);
                }
            }
        }
    }

    /// Réécrit les scores dont la persistance a échoué, renvoie le nombre restant
    pub async fn retry_pending(&self) -> usize {
        let ids: Vec<DeviceId> = self.pending.iter().map(|id| id.clone()).collect();
        for device_id in ids {
            let Some(cell) = self.devices.get(&device_id).map(|c| c.clone()) else {
                self.pending.remove(&device_id);
                continue;
            };
            let state = cell.lock().await;
            let snapshot = state.to_persisted();
            self.persist(&snapshot).await;
        }
        self.pending.len()
    }

    fn subscribers_snapshot(&self) -> Vec<Arc<dyn TrustSubscriber>> {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default()
    }

    pub fn score(&self, device_id: &DeviceId) -> Option<u8> {
        self.scores.get(device_id).map(|record| record.score)
    }

    pub fn record(&self, device_id: &DeviceId) -> Option<TrustScoreRecord> {
        self.scores.get(device_id).map(|record| record.clone())
    }

    pub fn records(&self) -> Vec<TrustScoreRecord> {
        self.scores.iter().map(|record| record.clone()).collect()
    }

    pub fn level(&self, device_id: &DeviceId) -> Option<TrustLevel> {
        self.score(device_id)
            .map(|score| trust_level(score, &self.settings.thresholds))
    }

    pub async fn history(&self, device_id: &DeviceId) -> Vec<TrustHistoryEntry> {
        let Some(cell) = self.devices.get(device_id).map(|c| c.clone()) else {
            return Vec::new();
        };
        let state = cell.lock().await;
        state.history.iter().cloned().collect()
    }

    /// Vrai si des scores restent non persistés après plusieurs échecs
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct Counter {
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<TrustChange>>,
    }

    #[async_trait]
    impl TrustSubscriber for Counter {
        async fn on_trust_change(&self, change: &TrustChange) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(change.clone());
        }
    }

    struct BrokenStore {
        fail: AtomicBool,
    }

    #[async_trait]
    impl TrustStore for BrokenStore {
        async fn load(&self, _: &DeviceId) -> Result<Option<PersistedTrust>, PersistenceError> {
            Ok(None)
        }

        async fn load_all(&self) -> Result<Vec<PersistedTrust>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn save(&self, _: &PersistedTrust) -> Result<(), PersistenceError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(PersistenceError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disque plein")))
            } else {
                Ok(())
            }
        }
    }

    fn engine_with(store: Arc<dyn TrustStore>) -> TrustScoreEngine {
        TrustScoreEngine::new(TrustSettings::default(), store, Arc::new(EventJournal::log_only()))
    }

    #[tokio::test]
    async fn test_initial_score_and_clamp() {
        let dir = tempdir().unwrap();
        let engine = engine_with(Arc::new(JsonTrustStore::new(dir.path())));
        let id = DeviceId::from("cam-1");

        assert_eq!(engine.initialize(&id).await, 70);
        assert_eq!(engine.adjust(&id, 80, "test").await, 100);
        assert_eq!(engine.adjust(&id, -250, "test").await, 0);
        assert_eq!(engine.record_alert(&id, Severity::High, "test").await, 0);
        assert_eq!(engine.score(&id), Some(0));
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_crossing_or_large_delta() {
        let dir = tempdir().unwrap();
        let engine = engine_with(Arc::new(JsonTrustStore::new(dir.path())));
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            last: std::sync::Mutex::new(None),
        });
        engine.subscribe(counter.clone());
        let id = DeviceId::from("cam-1");

        // +2 sans franchissement : pas de notification
        engine.record_good_behavior(&id).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);

        // 72 -> 68 franchit le seuil de 70
        engine.adjust(&id, -4, "test").await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        engine.record_alert(&id, Severity::Low, "test").await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        let last = counter.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.old_score, 68);
        assert_eq!(last.new_score, 58);
    }

    #[tokio::test]
    async fn test_good_behavior_capped_until_attestation() {
        let dir = tempdir().unwrap();
        let engine = engine_with(Arc::new(JsonTrustStore::new(dir.path())));
        let id = DeviceId::from("cam-1");

        engine.adjust(&id, -42, "test").await; // 28
        assert_eq!(engine.record_good_behavior(&id).await, 29);
        assert_eq!(engine.record_good_behavior(&id).await, 29);

        engine.record_attestation_pass(&id).await;
        assert_eq!(engine.record_good_behavior(&id).await, 31);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block() {
        let store = Arc::new(BrokenStore {
            fail: AtomicBool::new(true),
        });
        let engine = engine_with(store.clone());
        let id = DeviceId::from("cam-1");

        assert_eq!(engine.record_alert(&id, Severity::Medium, "test").await, 50);
        engine.record_alert(&id, Severity::Low, "test").await;
        assert_eq!(engine.score(&id), Some(40));
        assert!(engine.is_degraded());
        assert_eq!(engine.pending_count(), 1);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.retry_pending().await, 0);
        assert!(!engine.is_degraded());
    }

    #[tokio::test]
    async fn test_scores_survive_restart() {
        let dir = tempdir().unwrap();
        let id = DeviceId::from("cam-1");
        {
            let engine = engine_with(Arc::new(JsonTrustStore::new(dir.path())));
            engine.record_alert(&id, Severity::High, "test").await;
        }

        let engine = engine_with(Arc::new(JsonTrustStore::new(dir.path())));
        assert_eq!(engine.restore_all().await, 1);
        assert_eq!(engine.score(&id), Some(30));
        let history = engine.history(&id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].delta, -40);
    }

    #[test]
    fn test_trust_levels() {
        let t = TrustThresholds::default();
        assert_eq!(trust_level(70, &t), TrustLevel::Trusted);
        assert_eq!(trust_level(50, &t), TrustLevel::Monitored);
        assert_eq!(trust_level(30, &t), TrustLevel::Suspicious);
        assert_eq!(trust_level(29, &t), TrustLevel::Untrusted);
    }

    struct SlowRecorder {
        scores: std::sync::Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl TrustSubscriber for SlowRecorder {
        async fn on_trust_change(&self, change: &TrustChange) {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.scores.lock().unwrap().push(change.new_score);
        }
    }

    #[tokio::test]
    async fn test_reevaluation_never_overtakes_newer_change() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(engine_with(Arc::new(JsonTrustStore::new(dir.path()))));
        let recorder = Arc::new(SlowRecorder {
            scores: std::sync::Mutex::new(Vec::new()),
        });
        engine.subscribe(recorder.clone());
        let id = DeviceId::from("cam-1");

        let (reevaluated, alerted) = tokio::join!(
            engine.reevaluate(&id),
            engine.record_alert(&id, Severity::High, "test")
        );
        assert_eq!(alerted, 30);
        assert!(reevaluated == 70 || reevaluated == 30);

        let scores = recorder.scores.lock().unwrap().clone();
        assert_eq!(scores.len(), 2);
        // La dernière notification porte toujours le score final
        assert_eq!(scores.last(), Some(&30));
        assert_eq!(engine.reevaluate(&id).await, 30);
    }
}
