use crate::models::{AnomalyAlert, DeviceId, MitigationRule, PolicyDecision};
use crate::switch::FlowRule;
use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

/// Mode de journalisation utilisé par le système
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogMode {
    /// Journal dans un fichier local
    #[default]
    File,
    /// Journal via systemd-journal
    SystemdJournal,
}

/// Journal des événements de sécurité
///
/// Chaque alerte, changement de score, décision et règle installée y laisse
/// une ligne horodatée. Les erreurs d'écriture sont seulement signalées.
pub struct EventJournal {
    log_file: Mutex<Option<File>>,
    log_path: String,
    log_mode: LogMode,
}

impl EventJournal {
    pub fn new(log_path: String) -> Self {
        Self::new_with_mode(log_path, LogMode::File)
    }

    /// Journal redirigé vers la façade `log`, sans fichier
    pub fn log_only() -> Self {
        Self::new_with_mode(String::new(), LogMode::SystemdJournal)
    }

    pub fn new_with_mode(log_path: String, log_mode: LogMode) -> Self {
        let file = if log_mode == LogMode::File {
            // Créer le répertoire si nécessaire
            if let Some(parent) = Path::new(&log_path).parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Erreur lors de la création du répertoire du journal: {}", e);
                }
            }

            match OpenOptions::new().create(true).append(true).open(&log_path) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("Erreur lors de l'ouverture du journal {}: {}", log_path, e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            log_file: Mutex::new(file),
            log_path,
            log_mode,
        }
    }

    pub fn log_alert(&self, alert: &AnomalyAlert) {
        let entry = format!(
            "[ALERT] [{}] {} sévérité={} ratio={:.1} indicateurs={}",
            alert.device_id,
            alert.kind,
            alert.severity,
            alert.ratio,
            alert.indicators.join(",")
        );
        self.emit(alert.timestamp, &entry, Level::Warn);
    }

    pub fn log_trust_change(&self, device_id: &DeviceId, old: u8, new: u8, delta: i32, reason: &str) {
        let entry = format!(
            "[TRUST] [{}] {} -> {} (delta {:+}) {}",
            device_id, old, new, delta, reason
        );
        self.emit(SystemTime::now(), &entry, Level::Info);
    }

    pub fn log_decision(&self, decision: &PolicyDecision) {
        let entry = format!(
            "[DECISION] [{}] {} confiance={} menace={} alertes={} : {}",
            decision.device_id,
            decision.action,
            decision.trust_score,
            decision.threat_level,
            decision.recent_alerts,
            decision.reason
        );
        self.emit(decision.timestamp, &entry, Level::Info);
    }

    pub fn log_rule(&self, switch: &str, rule: &FlowRule, installed: bool) {
        let verb = if installed { "INSTALL" } else { "REMOVE" };
        let entry = format!(
            "[RULE] [{}] {} cookie={:#x} priorité={} action={:?} match={:?}",
            switch, verb, rule.cookie, rule.priority, rule.action, rule.match_fields
        );
        self.emit(SystemTime::now(), &entry, Level::Info);
    }

    pub fn log_mitigation(&self, rule: &MitigationRule) {
        let device = match &rule.device_id {
            Some(id) => id.to_string(),
            None => "N/A".to_string(),
        };
        let entry = format!(
            "[MITIGATION] [{}] {} source={} équipement={} priorité={} : {}",
            rule.id,
            rule.kind.as_str(),
            rule.source,
            device,
            rule.priority,
            rule.reason
        );
        self.emit(rule.created_at, &entry, Level::Warn);
    }

    pub fn log_unattributed(&self, source: IpAddr, description: &str) {
        let entry = format!("[INTEL] [IP: {}] non attribuée : {}", source, description);
        self.emit(SystemTime::now(), &entry, Level::Info);
    }

    pub fn log_enforcement_failure(&self, switch: &str, rule: &FlowRule, reason: &str) {
        let entry = format!(
            "[ENFORCEMENT] [{}] règle cookie={:#x} non appliquée : {}",
            switch, rule.cookie, reason
        );
        self.emit(SystemTime::now(), &entry, Level::Error);
    }

    fn emit(&self, at: SystemTime, entry: &str, level: Level) {
        let timestamp: DateTime<Local> = at.into();
        let formatted_time = timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let line = format!("[{}] {}", formatted_time, entry);

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", line)),
            LogMode::SystemdJournal => match level {
                Level::Info => info!("{}", line),
                Level::Warn => warn!("{}", line),
                Level::Error => error!("{}", line),
            },
        }
    }

    fn write_to_log(&self, message: &str) {
        let mut log_file_guard = match self.log_file.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Erreur lors de l'acquisition du verrou du journal: {}", e);
                return;
            }
        };

        if let Some(file) = log_file_guard.as_mut() {
            if let Err(e) = file.write_all(message.as_bytes()) {
                error!("Erreur lors de l'écriture dans le journal: {}", e);

                // Essayer de réouvrir le fichier
                *log_file_guard = match OpenOptions::new().create(true).append(true).open(&self.log_path) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        error!("Erreur lors de la réouverture du journal: {}", e);
                        None
                    }
                };
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertKind, Severity};
    use tempfile::tempdir;

    #[test]
    fn test_journal_writes_alert_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let journal = EventJournal::new(path.display().to_string());

        journal.log_alert(&AnomalyAlert {
            device_id: DeviceId::from("cam-1"),
            kind: AlertKind::Dos,
            severity: Severity::High,
            ratio: 12.0,
            indicators: vec!["dos".to_string()],
            timestamp: SystemTime::now(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[ALERT] [cam-1] dos sévérité=high"));
    }

    #[test]
    fn test_log_only_mode_has_no_file() {
        let journal = EventJournal::log_only();
        journal.log_unattributed("10.0.0.1".parse().unwrap(), "test");
        assert!(journal.log_file.lock().unwrap().is_none());
    }
}
