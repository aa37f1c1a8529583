use crate::error::ConfigError;
use crate::logger::LogMode;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "/etc/zsentinel/config.json";

/// Délai maximal autorisé pour un appel à un collaborateur
const MAX_POLL_TIMEOUT_SECS: u64 = 5;

/// Seuils de score de confiance utilisés par la décision de politique
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct TrustThresholds {
    /// En dessous : quarantaine
    pub quarantine: u8,
    /// En dessous : refus
    pub restricted: u8,
    /// À partir de ce score : équipement de confiance
    pub trusted: u8,
}

impl Default for TrustThresholds {
    fn default() -> Self {
        Self {
            quarantine: 30,
            restricted: 50,
            trusted: 70,
        }
    }
}

impl TrustThresholds {
    /// Seuils surveillés lors d'un changement de score
    pub fn watched(&self) -> [u8; 3] {
        [self.quarantine, self.restricted, self.trusted]
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Version actuelle du logiciel
    pub version: String,

    /// Niveau de log
    pub log_level: String,

    /// Mode de journalisation (fichier ou systemd-journal)
    pub log_mode: LogMode,

    /// Journal des événements de sécurité (alertes, décisions, règles)
    pub journal_file: String,

    /// Fichier d'inventaire des équipements
    pub inventory_file: String,

    /// Identifiants des commutateurs connectés
    pub switches: Vec<String>,

    /// Configuration de la collecte
    pub poll_interval_secs: u64,
    pub observation_window_secs: u64,
    pub poll_timeout_secs: u64,

    /// Configuration des profils de référence
    pub ema_alpha: f64,
    pub baseline_top_n: usize,

    /// Configuration de l'attestation
    pub attestation_interval_secs: u64,
    pub liveness_grace_secs: u64,

    /// Intervalle de réévaluation des politiques
    pub policy_sweep_interval_secs: u64,

    /// Configuration de la boucle leurre
    pub deception_scan_interval_secs: u64,
    pub deception_log_path: String,
    pub sustained_medium_events: u32,    // Événements moyens avant redirection
    pub event_burst_threshold: u32,      // Au-delà : refus
    pub destructive_commands: Vec<String>,
    pub intelligence_capacity: usize,

    /// Configuration du score de confiance
    pub initial_trust_score: u8,
    pub trust_thresholds: TrustThresholds,
    pub trust_history_limit: usize,
    pub trust_store_dir: String,
    pub persistence_retry_secs: u64,
    pub good_behavior_interval_secs: u64,

    /// Tailles des historiques en mémoire
    pub recent_alert_capacity: usize,
    pub decision_history_limit: usize,

    /// Configuration de l'application des règles
    pub honeypot_port: u32,
    pub install_retry_backoff_ms: u64,
    pub enforce_least_privilege: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            log_mode: LogMode::File,
            journal_file: "/var/log/zsentinel/events.log".to_string(),
            inventory_file: "/etc/zsentinel/inventory.json".to_string(),
            switches: vec!["s1".to_string()],

            // Collecte toutes les 10 secondes sur une fenêtre d'une minute
            poll_interval_secs: 10,
            observation_window_secs: 60,
            poll_timeout_secs: MAX_POLL_TIMEOUT_SECS,

            ema_alpha: 0.1,
            baseline_top_n: 10,

            attestation_interval_secs: 300,
            liveness_grace_secs: 600, // 2x l'intervalle d'attestation

            policy_sweep_interval_secs: 60,

            // Configuration de la boucle leurre
            deception_scan_interval_secs: 10,
            deception_log_path: "/var/log/cowrie/cowrie.json".to_string(),
            sustained_medium_events: 3,
            event_burst_threshold: 5,
            destructive_commands: ["rm", "dd", "mkfs", "shutdown", "reboot", "format", "delete"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            intelligence_capacity: 1000,

            // Configuration du score de confiance
            initial_trust_score: 70,
            trust_thresholds: TrustThresholds::default(),
            trust_history_limit: 1000,
            trust_store_dir: "/var/lib/zsentinel/trust".to_string(),
            persistence_retry_secs: 30,
            good_behavior_interval_secs: 300,

            recent_alert_capacity: 100,
            decision_history_limit: 100,

            honeypot_port: 3,
            install_retry_backoff_ms: 500,
            enforce_least_privilege: false,
        }
    }
}

impl Config {
    /// Charge la configuration depuis le fichier par défaut
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Charge et valide la configuration depuis un fichier
    ///
    /// Un fichier absent donne la configuration par défaut, qui est écrite
    /// si possible. Un fichier illisible ou invalide est une erreur fatale.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Config::default();
            if let Err(e) = default_config.save_to(path) {
                warn!("Impossible d'écrire la configuration par défaut dans {}: {}", path.display(), e);
            }
            return Ok(default_config);
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };

        // Créer le répertoire si nécessaire
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }

        let config_json = serde_json::to_string_pretty(self)?;
        fs::write(path, config_json).map_err(io_error)?;

        Ok(())
    }

    /// Vérifie la cohérence des seuils et intervalles
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.trust_thresholds;
        if !(t.quarantine < t.restricted && t.restricted < t.trusted && t.trusted <= 100) {
            return Err(ConfigError::invalid(
                "trust_thresholds",
                format!("{}/{}/{} doivent être strictement croissants et <= 100", t.quarantine, t.restricted, t.trusted),
            ));
        }
        if self.initial_trust_score > 100 {
            return Err(ConfigError::invalid("initial_trust_score", "doit être compris entre 0 et 100"));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid("ema_alpha", format!("{} hors de ]0, 1]", self.ema_alpha)));
        }
        if self.poll_timeout_secs == 0 || self.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS {
            return Err(ConfigError::invalid(
                "poll_timeout_secs",
                format!("doit être compris entre 1 et {}", MAX_POLL_TIMEOUT_SECS),
            ));
        }
        if self.observation_window_secs < self.poll_interval_secs {
            return Err(ConfigError::invalid(
                "observation_window_secs",
                "la fenêtre doit couvrir au moins un intervalle de collecte",
            ));
        }

        let intervals = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("attestation_interval_secs", self.attestation_interval_secs),
            ("policy_sweep_interval_secs", self.policy_sweep_interval_secs),
            ("deception_scan_interval_secs", self.deception_scan_interval_secs),
            ("persistence_retry_secs", self.persistence_retry_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::invalid(field, "l'intervalle ne peut pas être nul"));
            }
        }

        if self.baseline_top_n == 0 {
            return Err(ConfigError::invalid("baseline_top_n", "doit être positif"));
        }
        if self.sustained_medium_events == 0 {
            return Err(ConfigError::invalid("sustained_medium_events", "doit être positif"));
        }
        if self.trust_history_limit == 0 || self.recent_alert_capacity == 0 || self.decision_history_limit == 0 {
            return Err(ConfigError::invalid("history", "les tailles d'historique doivent être positives"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_secs(self.observation_window_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn attestation_interval(&self) -> Duration {
        Duration::from_secs(self.attestation_interval_secs)
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_secs(self.liveness_grace_secs)
    }

    pub fn policy_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.policy_sweep_interval_secs)
    }

    pub fn deception_scan_interval(&self) -> Duration {
        Duration::from_secs(self.deception_scan_interval_secs)
    }

    pub fn persistence_retry_interval(&self) -> Duration {
        Duration::from_secs(self.persistence_retry_secs)
    }

    pub fn good_behavior_interval(&self) -> Duration {
        Duration::from_secs(self.good_behavior_interval_secs)
    }

    pub fn install_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.install_retry_backoff_ms)
    }
}
