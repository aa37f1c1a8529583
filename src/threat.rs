//! Niveau de menace par équipement
//!
//! Fusionne les signaux de l'environnement leurre et du classificateur externe
//! optionnel. Seule la valeur courante est conservée.

use crate::error::ClassifierError;
use crate::models::{DeviceId, FlowWindowStats, Severity, ThreatLevel};
use async_trait::async_trait;
use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Confiance au-delà de laquelle un verdict d'attaque est jugé élevé
const HIGH_CONFIDENCE: f64 = 0.8;

/// Caractéristiques de trafic transmises au classificateur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFeatures {
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
    pub avg_packet_size: f64,
    pub distinct_destinations: usize,
    pub distinct_ports: usize,
}

impl From<&FlowWindowStats> for FlowFeatures {
    fn from(stats: &FlowWindowStats) -> Self {
        let avg_packet_size = if stats.packet_count > 0 {
            stats.byte_count as f64 / stats.packet_count as f64
        } else {
            0.0
        };
        Self {
            packets_per_sec: stats.packets_per_sec(),
            bytes_per_sec: stats.bytes_per_sec(),
            avg_packet_size,
            distinct_destinations: stats.destinations.len(),
            distinct_ports: stats.ports.len(),
        }
    }
}

/// Verdict du classificateur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub is_attack: bool,
    pub confidence: f64,
    pub attack_type: String,
}

impl Classification {
    pub fn threat_level(&self) -> ThreatLevel {
        if !self.is_attack {
            ThreatLevel::None
        } else if self.confidence > HIGH_CONFIDENCE {
            ThreatLevel::High
        } else {
            ThreatLevel::Medium
        }
    }
}

/// Classificateur externe optionnel
#[async_trait]
pub trait ThreatClassifier: Send + Sync {
    async fn classify(&self, features: &FlowFeatures) -> Result<Classification, ClassifierError>;
}

#[derive(Debug, Clone, Default)]
struct ThreatSignals {
    deception: ThreatLevel,
    classifier: ThreatLevel,
    updated_at: Option<SystemTime>,
}

impl ThreatSignals {
    fn fused(&self) -> ThreatLevel {
        if self.deception >= ThreatLevel::High && self.classifier >= ThreatLevel::High {
            ThreatLevel::Critical
        } else {
            self.deception.max(self.classifier)
        }
    }
}

/// Niveau de menace courant des équipements
pub struct ThreatBoard {
    signals: DashMap<DeviceId, ThreatSignals>,
}

impl ThreatBoard {
    pub fn new() -> Self {
        Self {
            signals: DashMap::new(),
        }
    }

    /// Un événement leurre attribué ne fait que relever le niveau
    pub fn raise_from_deception(&self, device_id: &DeviceId, severity: Severity) -> ThreatLevel {
        let mut signals = self.signals.entry(device_id.clone()).or_default();
        signals.deception = signals.deception.max(ThreatLevel::from(severity));
        signals.updated_at = Some(SystemTime::now());
        signals.fused()
    }

    /// Le dernier verdict du classificateur remplace le précédent
    pub fn record_classification(&self, device_id: &DeviceId, classification: &Classification) -> ThreatLevel {
        let mut signals = self.signals.entry(device_id.clone()).or_default();
        signals.classifier = classification.threat_level();
        signals.updated_at = Some(SystemTime::now());
        signals.fused()
    }

    pub fn level(&self, device_id: &DeviceId) -> ThreatLevel {
        self.signals
            .get(device_id)
            .map(|signals| signals.fused())
            .unwrap_or_default()
    }

    /// Menace traitée par un opérateur
    pub fn resolve(&self, device_id: &DeviceId) {
        if self.signals.remove(device_id).is_some() {
            info!("Menace résolue pour {}", device_id);
        }
    }

    pub fn active(&self) -> Vec<(DeviceId, ThreatLevel)> {
        self.signals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().fused()))
            .filter(|(_, level)| *level > ThreatLevel::None)
            .collect()
    }
}

impl Default for ThreatBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(is_attack: bool, confidence: f64) -> Classification {
        Classification {
            is_attack,
            confidence,
            attack_type: "ddos".to_string(),
        }
    }

    #[test]
    fn test_classification_levels() {
        assert_eq!(verdict(false, 0.99).threat_level(), ThreatLevel::None);
        assert_eq!(verdict(true, 0.9).threat_level(), ThreatLevel::High);
        assert_eq!(verdict(true, 0.6).threat_level(), ThreatLevel::Medium);
    }

    #[test]
    fn test_fusion() {
        let board = ThreatBoard::new();
        let id = DeviceId::from("cam-1");
        assert_eq!(board.level(&id), ThreatLevel::None);

        assert_eq!(board.raise_from_deception(&id, Severity::Medium), ThreatLevel::Medium);
        // Un signal plus faible ne fait pas redescendre le niveau
        assert_eq!(board.raise_from_deception(&id, Severity::Low), ThreatLevel::Medium);
        assert_eq!(board.raise_from_deception(&id, Severity::High), ThreatLevel::High);
        assert_eq!(board.record_classification(&id, &verdict(true, 0.95)), ThreatLevel::Critical);

        board.resolve(&id);
        assert_eq!(board.level(&id), ThreatLevel::None);
        assert!(board.active().is_empty());
    }
}
