use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Priorités des règles de commutation
pub mod priority {
    /// Refus implicite terminant une liste de règles
    pub const DEFAULT_DENY: u16 = 0;
    /// Règles d'autorisation (politique du moindre privilège)
    pub const ALLOW: u16 = 100;
    /// Enregistrement de surveillance (jamais installé)
    pub const MONITOR: u16 = 100;
    /// Redirection vers l'environnement leurre
    pub const REDIRECT: u16 = 150;
    /// Refus (politique ou mitigation confirmée)
    pub const DENY: u16 = 200;
    /// Mise en quarantaine, toujours la plus haute
    pub const QUARANTINE: u16 = 1000;
}

/// Identifiant stable d'un équipement
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// État d'un équipement côté identité
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Quarantined,
    Revoked,
}

/// Équipement connu du collaborateur d'identité
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub mac: MacAddr,
    /// Dernière adresse IP apprise
    pub ip: Option<IpAddr>,
    pub status: DeviceStatus,
}

/// Sévérité d'une alerte ou d'un événement leurre
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Variation du score de confiance associée à une alerte de cette sévérité
    pub fn trust_delta(self) -> i32 {
        match self {
            Severity::Low => -10,
            Severity::Medium => -20,
            Severity::High => -40,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catégorie d'alerte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Dos,
    VolumeAttack,
    Scanning,
    PortScanning,
    /// Événement synthétique émis par l'attestation
    AttestationFailure,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Dos => "dos",
            AlertKind::VolumeAttack => "volume_attack",
            AlertKind::Scanning => "scanning",
            AlertKind::PortScanning => "port_scanning",
            AlertKind::AttestationFailure => "attestation_failure",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alerte produite par le détecteur d'anomalies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub device_id: DeviceId,
    pub kind: AlertKind,
    pub severity: Severity,
    /// Rapport entre la valeur observée et la référence
    pub ratio: f64,
    /// Toutes les catégories ayant déclenché pendant le cycle
    pub indicators: Vec<String>,
    pub timestamp: SystemTime,
}

/// Statistiques de trafic d'un équipement sur la fenêtre d'observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowWindowStats {
    pub device_id: DeviceId,
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub packet_count: u64,
    pub byte_count: u64,
    pub destinations: HashSet<IpAddr>,
    pub ports: HashSet<u16>,
}

impl FlowWindowStats {
    pub fn duration(&self) -> Duration {
        self.window_end
            .duration_since(self.window_start)
            .unwrap_or(Duration::ZERO)
    }

    pub fn packets_per_sec(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.packet_count as f64 / secs
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.byte_count as f64 / secs
    }
}

/// Profil de comportement attendu d'un équipement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralBaseline {
    pub device_id: DeviceId,
    pub avg_pps: f64,
    pub avg_bps: f64,
    /// Nombre moyen de destinations distinctes par fenêtre
    pub avg_destinations: f64,
    /// Nombre moyen de ports distincts par fenêtre
    pub avg_ports: f64,
    pub common_destinations: Vec<IpAddr>,
    pub common_ports: Vec<u16>,
    pub(crate) destination_weights: HashMap<IpAddr, f64>,
    pub(crate) port_weights: HashMap<u16, f64>,
    pub samples: u64,
    pub updated_at: SystemTime,
}

impl BehavioralBaseline {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            avg_pps: 0.0,
            avg_bps: 0.0,
            avg_destinations: 0.0,
            avg_ports: 0.0,
            common_destinations: Vec::new(),
            common_ports: Vec::new(),
            destination_weights: HashMap::new(),
            port_weights: HashMap::new(),
            samples: 0,
            updated_at: SystemTime::now(),
        }
    }

    /// Référence fournie à l'enrôlement
    pub fn with_rates(device_id: DeviceId, avg_pps: f64, avg_bps: f64) -> Self {
        let mut baseline = Self::new(device_id);
        baseline.avg_pps = avg_pps;
        baseline.avg_bps = avg_bps;
        baseline
    }

    pub fn with_cardinality(mut self, avg_destinations: f64, avg_ports: f64) -> Self {
        self.avg_destinations = avg_destinations;
        self.avg_ports = avg_ports;
        self
    }

    pub fn with_common_destinations(mut self, destinations: Vec<IpAddr>) -> Self {
        for ip in &destinations {
            self.destination_weights.insert(*ip, 1.0);
        }
        self.common_destinations = destinations;
        self
    }

    pub fn with_common_ports(mut self, ports: Vec<u16>) -> Self {
        for port in &ports {
            self.port_weights.insert(*port, 1.0);
        }
        self.common_ports = ports;
        self
    }

    /// Aucun trafic n'a encore été enregistré
    pub fn has_no_traffic(&self) -> bool {
        self.avg_pps <= 0.0 && self.avg_bps <= 0.0
    }
}

/// Niveau de menace courant d'un équipement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl From<Severity> for ThreatLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => ThreatLevel::Low,
            Severity::Medium => ThreatLevel::Medium,
            Severity::High => ThreatLevel::High,
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ThreatLevel::None),
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(format!("niveau de menace inconnu: {}", other)),
        }
    }
}

/// Signification d'une plage de score de confiance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Monitored,
    Suspicious,
    Untrusted,
}

/// Score de confiance courant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScoreRecord {
    pub device_id: DeviceId,
    pub score: u8,
    pub updated_at: SystemTime,
}

/// Entrée de l'historique des scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    pub score: u8,
    pub delta: i32,
    pub reason: String,
    pub timestamp: SystemTime,
}

/// Action de politique appliquée au trafic d'un équipement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    Allow,
    Redirect,
    Deny,
    Quarantine,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyAction::Allow => "ALLOW",
            PolicyAction::Redirect => "REDIRECT",
            PolicyAction::Deny => "DENY",
            PolicyAction::Quarantine => "QUARANTINE",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Décision de politique enregistrée dans le journal d'audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub device_id: DeviceId,
    pub action: PolicyAction,
    pub reason: String,
    pub timestamp: SystemTime,
    pub trust_score: u8,
    pub threat_level: ThreatLevel,
    /// Nombre d'alertes récentes prises en compte
    pub recent_alerts: usize,
}

/// Critères de correspondance d'une règle de commutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_dst: Option<MacAddr>,
    /// Adresse source, IPv4 ou IPv6
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_src: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_dst: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_dst: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_dst: Option<u16>,
}

impl MatchFields {
    pub fn from_mac(mac: MacAddr) -> Self {
        Self {
            eth_src: Some(mac),
            ..Default::default()
        }
    }

    pub fn from_source_ip(ip: IpAddr) -> Self {
        Self {
            ip_src: Some(ip),
            ..Default::default()
        }
    }

    /// Port de destination, TCP ou UDP
    pub fn destination_port(&self) -> Option<u16> {
        self.tcp_dst.or(self.udp_dst)
    }
}

/// Type de règle de mitigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationKind {
    Deny,
    Redirect,
    Monitor,
}

impl MitigationKind {
    pub fn priority(self) -> u16 {
        match self {
            MitigationKind::Deny => priority::DENY,
            MitigationKind::Redirect => priority::REDIRECT,
            MitigationKind::Monitor => priority::MONITOR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MitigationKind::Deny => "deny",
            MitigationKind::Redirect => "redirect",
            MitigationKind::Monitor => "monitor",
        }
    }
}

/// Règle confirmée issue de l'environnement leurre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationRule {
    pub id: String,
    pub kind: MitigationKind,
    pub source: IpAddr,
    pub device_id: Option<DeviceId>,
    pub match_fields: MatchFields,
    pub priority: u16,
    pub reason: String,
    pub created_at: SystemTime,
}

impl MitigationRule {
    pub fn new(kind: MitigationKind, source: IpAddr, device_id: Option<DeviceId>, reason: String) -> Self {
        Self {
            id: format!("{}-{}", kind.as_str(), source),
            kind,
            source,
            device_id,
            match_fields: MatchFields::from_source_ip(source),
            priority: kind.priority(),
            reason,
            created_at: SystemTime::now(),
        }
    }
}
