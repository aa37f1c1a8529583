//! Renseignement sur les menaces, agrégé par adresse source

use super::parser::DeceptionEvent;
use crate::models::{DeviceId, MitigationKind, MitigationRule, Severity};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::SystemTime;

/// Commandes récentes conservées par source
const RECENT_COMMANDS: usize = 10;

/// État agrégé d'une adresse source
#[derive(Debug, Clone, Serialize)]
pub struct SourceThreat {
    pub source: IpAddr,
    pub device_id: Option<DeviceId>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub events: u64,
    pub low_events: u64,
    pub medium_events: u64,
    pub high_events: u64,
    pub recent_commands: VecDeque<String>,
    /// Règle en place pour cette source
    pub rule: Option<MitigationKind>,
}

impl SourceThreat {
    fn new(source: IpAddr, now: SystemTime) -> Self {
        Self {
            source,
            device_id: None,
            first_seen: now,
            last_seen: now,
            events: 0,
            low_events: 0,
            medium_events: 0,
            high_events: 0,
            recent_commands: VecDeque::new(),
            rule: None,
        }
    }

    pub fn max_severity(&self) -> Severity {
        if self.high_events > 0 {
            Severity::High
        } else if self.medium_events > 0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Événement dont la source n'a pu être rattachée à aucun équipement
#[derive(Debug, Clone, Serialize)]
pub struct UnattributedEvent {
    pub source: IpAddr,
    pub severity: Severity,
    pub description: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntelStats {
    pub sources: usize,
    pub attributed_sources: usize,
    pub total_events: u64,
    pub high_events: u64,
    pub medium_events: u64,
    pub low_events: u64,
    pub unattributed_events: usize,
    pub deny_rules: usize,
    pub redirect_rules: usize,
}

/// Poids d'éviction : les sources sans blocage partent en premier
fn retention(rule: Option<MitigationKind>) -> u8 {
    match rule {
        None | Some(MitigationKind::Monitor) => 0,
        Some(MitigationKind::Redirect) => 1,
        Some(MitigationKind::Deny) => 2,
    }
}

/// Sources et événements non attribués, tous deux limités à `capacity`
pub struct ThreatIntel {
    sources: DashMap<IpAddr, SourceThreat>,
    unattributed: Mutex<VecDeque<UnattributedEvent>>,
    capacity: usize,
    sustained_medium: u64,
    burst_threshold: u64,
}

impl ThreatIntel {
    pub fn new(sustained_medium: u64, burst_threshold: u64, capacity: usize) -> Self {
        Self {
            sources: DashMap::new(),
            unattributed: Mutex::new(VecDeque::new()),
            capacity,
            sustained_medium,
            burst_threshold,
        }
    }

    /// Ajoute un événement et renvoie l'état agrégé de sa source
    pub fn record(&self, event: &DeceptionEvent, severity: Severity, device_id: Option<&DeviceId>) -> SourceThreat {
        let now = SystemTime::now();
        let mut entry = self
            .sources
            .entry(event.source)
            .or_insert_with(|| SourceThreat::new(event.source, now));

        entry.last_seen = now;
        entry.events += 1;
        match severity {
            Severity::Low => entry.low_events += 1,
            Severity::Medium => entry.medium_events += 1,
            Severity::High => entry.high_events += 1,
        }
        if let Some(command) = &event.command {
            entry.recent_commands.push_back(command.clone());
            while entry.recent_commands.len() > RECENT_COMMANDS {
                entry.recent_commands.pop_front();
            }
        }
        if let Some(id) = device_id {
            entry.device_id = Some(id.clone());
        }
        let snapshot = entry.clone();
        drop(entry);

        if device_id.is_none() {
            self.remember_unattributed(UnattributedEvent {
                source: event.source,
                severity,
                description: event.describe(),
                timestamp: event.timestamp,
            });
        }
        snapshot
    }

    fn remember_unattributed(&self, event: UnattributedEvent) {
        if let Ok(mut buffer) = self.unattributed.lock() {
            buffer.push_back(event);
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }
    }

    /// Ramène le nombre de sources suivies sous la capacité
    ///
    /// Les sources sans règle de blocage sont évincées d'abord, de la plus
    /// ancienne à la plus récente. Renvoie les sources évincées pour que
    /// l'appelant retire leurs règles.
    pub fn prune(&self) -> Vec<SourceThreat> {
        let mut evicted = Vec::new();
        while self.sources.len() > self.capacity {
            let victim = self
                .sources
                .iter()
                .min_by_key(|entry| (retention(entry.rule), entry.last_seen))
                .map(|entry| *entry.key());
            let Some(victim) = victim else {
                break;
            };
            if let Some((_, threat)) = self.sources.remove(&victim) {
                evicted.push(threat);
            }
        }
        evicted
    }

    /// Type de règle mérité par une source
    pub fn mitigation_kind(&self, threat: &SourceThreat) -> MitigationKind {
        if threat.high_events > 0 || threat.events > self.burst_threshold {
            MitigationKind::Deny
        } else if threat.medium_events >= self.sustained_medium {
            MitigationKind::Redirect
        } else {
            MitigationKind::Monitor
        }
    }

    pub fn mitigation_for(&self, threat: &SourceThreat) -> MitigationRule {
        let kind = self.mitigation_kind(threat);
        let reason = match kind {
            MitigationKind::Deny if threat.high_events > 0 => {
                format!("{} événement(s) de sévérité élevée", threat.high_events)
            }
            MitigationKind::Deny => format!("rafale de {} événements", threat.events),
            MitigationKind::Redirect => format!("{} événements de sévérité moyenne", threat.medium_events),
            MitigationKind::Monitor => format!("{} événement(s) sous surveillance", threat.events),
        };
        MitigationRule::new(kind, threat.source, threat.device_id.clone(), reason)
    }

    /// Note la règle installée pour une source
    pub fn set_rule(&self, source: IpAddr, kind: MitigationKind) {
        if let Some(mut entry) = self.sources.get_mut(&source) {
            entry.rule = Some(kind);
        }
    }

    pub fn source(&self, source: &IpAddr) -> Option<SourceThreat> {
        self.sources.get(source).map(|entry| entry.clone())
    }

    /// Sources triées de la plus récente à la plus ancienne
    pub fn sources(&self) -> Vec<SourceThreat> {
        let mut sources: Vec<SourceThreat> = self.sources.iter().map(|entry| entry.clone()).collect();
        sources.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        sources
    }

    pub fn unattributed(&self, limit: usize) -> Vec<UnattributedEvent> {
        match self.unattributed.lock() {
            Ok(buffer) => buffer.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stats(&self) -> IntelStats {
        let mut stats = IntelStats {
            unattributed_events: self.unattributed.lock().map(|b| b.len()).unwrap_or(0),
            ..Default::default()
        };
        for entry in self.sources.iter() {
            stats.sources += 1;
            if entry.device_id.is_some() {
                stats.attributed_sources += 1;
            }
            stats.total_events += entry.events;
            stats.high_events += entry.high_events;
            stats.medium_events += entry.medium_events;
            stats.low_events += entry.low_events;
            match entry.rule {
                Some(MitigationKind::Deny) => stats.deny_rules += 1,
                Some(MitigationKind::Redirect) => stats.redirect_rules += 1,
                _ => {}
            }
        }
        stats
    }
}
