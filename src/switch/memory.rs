use super::{FlowRule, FlowStatEntry, SwitchControl};
use crate::error::SwitchError;
use crate::models::MatchFields;
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct FlowCounters {
    match_fields: MatchFields,
    packets: u64,
    bytes: u64,
    created: Instant,
    duration: Option<Duration>,
}

/// Commutateur en mémoire
///
/// Tient une table de règles et des compteurs de flux alimentés par
/// `add_traffic` ou `set_flow`. Sert de banc d'essai et au mode simulation.
pub struct MemorySwitch {
    id: String,
    flows: Mutex<Vec<FlowCounters>>,
    rules: Mutex<Vec<FlowRule>>,
    reachable: AtomicBool,
    pending_rejections: AtomicU32,
}

impl MemorySwitch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flows: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            pending_rejections: AtomicU32::new(0),
        }
    }

    /// Ajoute du trafic aux compteurs cumulés du flux
    pub fn add_traffic(&self, match_fields: MatchFields, packets: u64, bytes: u64) {
        let Ok(mut flows) = self.flows.lock() else {
            return;
        };
        match flows.iter_mut().find(|f| f.match_fields == match_fields) {
            Some(flow) => {
                flow.packets += packets;
                flow.bytes += bytes;
            }
            None => flows.push(FlowCounters {
                match_fields,
                packets,
                bytes,
                created: Instant::now(),
                duration: None,
            }),
        }
    }

    /// Remplace les compteurs d'un flux, ancienneté comprise
    pub fn set_flow(&self, entry: FlowStatEntry) {
        let Ok(mut flows) = self.flows.lock() else {
            return;
        };
        flows.retain(|f| f.match_fields != entry.match_fields);
        flows.push(FlowCounters {
            match_fields: entry.match_fields,
            packets: entry.packet_count,
            bytes: entry.byte_count,
            created: Instant::now(),
            duration: Some(entry.duration),
        });
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Les `count` prochaines installations seront refusées
    pub fn reject_next_installs(&self, count: u32) {
        self.pending_rejections.store(count, Ordering::SeqCst);
    }

    pub fn rules(&self) -> Vec<FlowRule> {
        self.rules.lock().map(|rules| rules.clone()).unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<(), SwitchError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwitchError::Unreachable(self.id.clone()))
        }
    }
}

#[async_trait]
impl SwitchControl for MemorySwitch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn flow_stats(&self) -> Result<Vec<FlowStatEntry>, SwitchError> {
        self.check_reachable()?;
        let flows = self
            .flows
            .lock()
            .map_err(|e| SwitchError::Unreachable(e.to_string()))?;

        Ok(flows
            .iter()
            .map(|f| FlowStatEntry {
                match_fields: f.match_fields.clone(),
                packet_count: f.packets,
                byte_count: f.bytes,
                duration: f.duration.unwrap_or_else(|| f.created.elapsed()),
            })
            .collect())
    }

    async fn install_rule(&self, rule: &FlowRule) -> Result<(), SwitchError> {
        self.check_reachable()?;

        let rejected = self
            .pending_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SwitchError::Rejected(format!("table pleine sur {}", self.id)));
        }

        let mut rules = self
            .rules
            .lock()
            .map_err(|e| SwitchError::Rejected(e.to_string()))?;
        // Une règle de même priorité et même correspondance remplace l'ancienne
        rules.retain(|r| !r.same_entry(rule));
        rules.push(rule.clone());
        debug!("[{}] règle {:#x} installée (priorité {})", self.id, rule.cookie, rule.priority);
        Ok(())
    }

    async fn remove_rule(&self, rule: &FlowRule) -> Result<bool, SwitchError> {
        self.check_reachable()?;
        let mut rules = self
            .rules
            .lock()
            .map_err(|e| SwitchError::Rejected(e.to_string()))?;
        let before = rules.len();
        rules.retain(|r| !r.same_entry(rule));
        Ok(rules.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::FlowAction;
    use pnet::util::MacAddr;

    fn drop_rule(priority: u16) -> FlowRule {
        FlowRule {
            cookie: 1,
            priority,
            match_fields: MatchFields::from_mac(MacAddr::new(0, 0, 0, 0, 0, 1)),
            action: FlowAction::Drop,
        }
    }

    #[tokio::test]
    async fn test_install_replaces_same_entry() {
        let switch = MemorySwitch::new("s1");
        switch.install_rule(&drop_rule(200)).await.unwrap();
        switch.install_rule(&drop_rule(200)).await.unwrap();
        switch.install_rule(&drop_rule(150)).await.unwrap();
        assert_eq!(switch.rules().len(), 2);

        assert!(switch.remove_rule(&drop_rule(200)).await.unwrap());
        assert!(!switch.remove_rule(&drop_rule(200)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejections_and_unreachable() {
        let switch = MemorySwitch::new("s1");
        switch.reject_next_installs(1);
        assert!(switch.install_rule(&drop_rule(200)).await.is_err());
        assert!(switch.install_rule(&drop_rule(200)).await.is_ok());

        switch.set_reachable(false);
        assert!(switch.flow_stats().await.is_err());
    }

    #[tokio::test]
    async fn test_traffic_accumulates() {
        let switch = MemorySwitch::new("s1");
        let fields = MatchFields::from_mac(MacAddr::new(0, 0, 0, 0, 0, 2));
        switch.add_traffic(fields.clone(), 10, 1000);
        switch.add_traffic(fields, 5, 500);

        let stats = switch.flow_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].packet_count, 15);
        assert_eq!(stats[0].byte_count, 1500);
    }
}
