use crate::models::{AlertKind, AnomalyAlert, BehavioralBaseline, DeviceId, FlowWindowStats, Severity};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

/// Destinations distinctes au-delà desquelles un balayage est possible
const SCAN_MIN_DESTINATIONS: usize = 20;
/// Ports distincts au-delà desquels un balayage de ports est possible
const SCAN_MIN_PORTS: usize = 10;

/// Constat d'une règle de détection
#[derive(Debug, Clone, PartialEq)]
struct Finding {
    kind: AlertKind,
    severity: Severity,
    ratio: f64,
}

/// Compare une fenêtre de trafic au profil de référence
///
/// Chaque catégorie est évaluée séparément. Le constat le plus sévère
/// (à sévérité égale, le premier dans l'ordre débit, volume, destinations,
/// ports) donne l'alerte ; les autres sont listés dans ses indicateurs.
/// Un profil sans trafic enregistré ne permet aucune évaluation.
pub fn detect(stats: &FlowWindowStats, baseline: &BehavioralBaseline) -> Option<AnomalyAlert> {
    if baseline.has_no_traffic() {
        return None;
    }

    let mut findings = Vec::new();

    // Débit en paquets
    if baseline.avg_pps > 0.0 {
        let ratio = stats.packets_per_sec() / baseline.avg_pps;
        // Les paliers 10x et 5x donnent tous deux une sévérité haute
        let severity = if ratio > 5.0 {
            Some(Severity::High)
        } else if ratio > 2.0 {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            findings.push(Finding {
                kind: AlertKind::Dos,
                severity,
                ratio,
            });
        }
    }

    // Volume en octets
    if baseline.avg_bps > 0.0 {
        let ratio = stats.bytes_per_sec() / baseline.avg_bps;
        if ratio > 10.0 {
            findings.push(Finding {
                kind: AlertKind::VolumeAttack,
                severity: Severity::High,
                ratio,
            });
        }
    }

    // Diversité des destinations
    let destinations = stats.destinations.len();
    if destinations as f64 > 5.0 * baseline.avg_destinations && destinations > SCAN_MIN_DESTINATIONS {
        findings.push(Finding {
            kind: AlertKind::Scanning,
            severity: Severity::Medium,
            ratio: cardinality_ratio(destinations, baseline.avg_destinations),
        });
    }

    // Diversité des ports
    let ports = stats.ports.len();
    if ports as f64 > 3.0 * baseline.avg_ports && ports > SCAN_MIN_PORTS {
        findings.push(Finding {
            kind: AlertKind::PortScanning,
            severity: Severity::Medium,
            ratio: cardinality_ratio(ports, baseline.avg_ports),
        });
    }

    let indicators = findings.iter().map(|f| f.kind.as_str().to_string()).collect();
    let mut strongest: Option<Finding> = None;
    for finding in findings {
        match &strongest {
            Some(current) if current.severity >= finding.severity => {}
            _ => strongest = Some(finding),
        }
    }

    strongest.map(|finding| AnomalyAlert {
        device_id: stats.device_id.clone(),
        kind: finding.kind,
        severity: finding.severity,
        ratio: finding.ratio,
        indicators,
        timestamp: stats.window_end,
    })
}

fn cardinality_ratio(observed: usize, expected: f64) -> f64 {
    if expected > 0.0 {
        observed as f64 / expected
    } else {
        observed as f64
    }
}

/// Tampon circulaire des alertes récentes
pub struct AlertLog {
    alerts: Mutex<VecDeque<AnomalyAlert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, alert: AnomalyAlert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            if alerts.len() >= self.capacity {
                alerts.pop_front();
            }
            alerts.push_back(alert);
        }
    }

    /// Les `count` alertes les plus récentes, de la plus ancienne à la plus récente
    pub fn recent(&self, count: usize) -> Vec<AnomalyAlert> {
        match self.alerts.lock() {
            Ok(alerts) => {
                let skip = alerts.len().saturating_sub(count);
                alerts.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Alertes d'un équipement encore présentes dans le tampon depuis `since`
    pub fn for_device(&self, device_id: &DeviceId, since: SystemTime) -> Vec<AnomalyAlert> {
        match self.alerts.lock() {
            Ok(alerts) => alerts
                .iter()
                .filter(|a| &a.device_id == device_id && a.timestamp >= since)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn window(pps: u64, bps: u64, destinations: usize, ports: usize) -> FlowWindowStats {
        let end = SystemTime::now();
        FlowWindowStats {
            device_id: DeviceId::from("cam-1"),
            window_start: end - Duration::from_secs(60),
            window_end: end,
            packet_count: pps * 60,
            byte_count: bps * 60,
            destinations: (0..destinations)
                .map(|i| IpAddr::V4(Ipv4Addr::new(10, 1, (i / 250) as u8, (i % 250) as u8)))
                .collect(),
            ports: (0..ports).map(|p| 1000 + p as u16).collect::<HashSet<u16>>(),
        }
    }

    fn baseline(pps: f64, bps: f64) -> BehavioralBaseline {
        BehavioralBaseline::with_rates(DeviceId::from("cam-1"), pps, bps).with_cardinality(2.0, 2.0)
    }

    #[test]
    fn test_rate_thresholds() {
        let b = baseline(10.0, 10_000.0);
        let alert = detect(&window(120, 1000, 0, 0), &b).unwrap();
        assert_eq!(alert.kind, AlertKind::Dos);
        assert_eq!(alert.severity, Severity::High);
        assert!((alert.ratio - 12.0).abs() < 1e-9);

        let alert = detect(&window(60, 1000, 0, 0), &b).unwrap();
        assert_eq!(alert.severity, Severity::High);

        let alert = detect(&window(30, 1000, 0, 0), &b).unwrap();
        assert_eq!(alert.severity, Severity::Medium);

        assert!(detect(&window(20, 1000, 0, 0), &b).is_none());
    }

    #[test]
    fn test_volume_attack() {
        let b = baseline(10.0, 1000.0);
        let alert = detect(&window(10, 20_000, 0, 0), &b).unwrap();
        assert_eq!(alert.kind, AlertKind::VolumeAttack);
        assert_eq!(alert.severity, Severity::High);
    }

    #[test]
    fn test_scanning_needs_absolute_floor() {
        let b = baseline(10.0, 1000.0);
        // 15 destinations : plus de 5x la référence mais sous le plancher de 20
        assert!(detect(&window(10, 1000, 15, 0), &b).is_none());

        let alert = detect(&window(10, 1000, 25, 0), &b).unwrap();
        assert_eq!(alert.kind, AlertKind::Scanning);
        assert_eq!(alert.severity, Severity::Medium);

        let alert = detect(&window(10, 1000, 0, 12), &b).unwrap();
        assert_eq!(alert.kind, AlertKind::PortScanning);
    }

    #[test]
    fn test_zero_baseline_is_skipped() {
        let b = BehavioralBaseline::new(DeviceId::from("cam-1"));
        assert!(detect(&window(100_000, 10_000_000, 100, 100), &b).is_none());

        // Débit de référence nul mais octets connus : pas d'alerte de débit
        let b = baseline(0.0, 1000.0);
        let alert = detect(&window(100_000, 1000, 0, 0), &b);
        assert!(alert.is_none());
    }

    #[test]
    fn test_single_alert_lists_all_indicators() {
        let b = baseline(10.0, 1000.0);
        let alert = detect(&window(30, 20_000, 25, 0), &b).unwrap();
        assert_eq!(alert.kind, AlertKind::VolumeAttack);
        assert_eq!(alert.indicators, vec!["dos", "volume_attack", "scanning"]);
    }

    #[test]
    fn test_alert_log_is_bounded() {
        let log = AlertLog::new(3);
        let b = baseline(10.0, 10_000.0);
        for _ in 0..5 {
            log.push(detect(&window(120, 1000, 0, 0), &b).unwrap());
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.recent(2).len(), 2);
        let since = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(log.for_device(&DeviceId::from("cam-1"), since).len(), 3);
    }
}
