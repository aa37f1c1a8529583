//! Interface de contrôle des commutateurs
//!
//! Le cœur ne parle aux commutateurs qu'à travers `SwitchControl` : lecture des
//! compteurs par flux et installation/suppression de règles.

pub mod memory;

use crate::error::SwitchError;
use crate::models::MatchFields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub use memory::MemorySwitch;

/// Action d'une règle de commutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    /// Acheminement normal
    Normal,
    /// Envoi vers un port du commutateur
    Forward(u32),
    Drop,
}

/// Règle installée sur un commutateur
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRule {
    pub cookie: u64,
    pub priority: u16,
    pub match_fields: MatchFields,
    pub action: FlowAction,
}

impl FlowRule {
    /// Deux règles occupent la même entrée de table
    pub fn same_entry(&self, other: &FlowRule) -> bool {
        self.priority == other.priority && self.match_fields == other.match_fields
    }
}

/// Compteurs cumulés d'un flux
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatEntry {
    pub match_fields: MatchFields,
    pub packet_count: u64,
    pub byte_count: u64,
    /// Ancienneté du flux sur le commutateur
    pub duration: Duration,
}

#[async_trait]
pub trait SwitchControl: Send + Sync {
    fn id(&self) -> &str;

    /// Compteurs par flux, indexés par adresse MAC source
    async fn flow_stats(&self) -> Result<Vec<FlowStatEntry>, SwitchError>;

    async fn install_rule(&self, rule: &FlowRule) -> Result<(), SwitchError>;

    /// Renvoie `false` si la règle n'était pas présente
    async fn remove_rule(&self, rule: &FlowRule) -> Result<bool, SwitchError>;
}

/// Cookie stable dérivé du propriétaire et de l'usage de la règle
pub fn cookie_for(owner: &str, tag: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    owner.hash(&mut hasher);
    tag.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_is_stable_per_tag() {
        assert_eq!(cookie_for("thermostat-2", "redirect"), cookie_for("thermostat-2", "redirect"));
        assert_ne!(cookie_for("thermostat-2", "redirect"), cookie_for("thermostat-2", "quarantine"));
    }
}
