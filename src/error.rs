//! Taxonomie des erreurs du cœur de contrôle
//!
//! Aucune de ces erreurs n'arrête le processus, sauf `ConfigError` au démarrage.

use crate::models::DeviceId;
use std::net::IpAddr;
use thiserror::Error;

/// Erreur renvoyée par un commutateur
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("commutateur injoignable: {0}")]
    Unreachable(String),

    #[error("règle refusée: {0}")]
    Rejected(String),
}

/// Échec de collecte des compteurs d'un commutateur
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("délai dépassé lors de l'interrogation du commutateur {switch}")]
    Timeout { switch: String },

    #[error("commutateur {switch} indisponible: {source}")]
    Switch {
        switch: String,
        #[source]
        source: SwitchError,
    },
}

/// Entrée du journal leurre illisible
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("ligne vide")]
    Empty,

    #[error("JSON invalide: {0}")]
    Json(#[from] serde_json::Error),

    #[error("adresse source absente ou invalide: {0}")]
    MissingSource(String),
}

/// Règle refusée par un commutateur après la nouvelle tentative
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("installation impossible sur {switch}: {reason}")]
    Rejected { switch: String, reason: String },

    #[error("délai dépassé lors de l'installation sur {switch}")]
    Timeout { switch: String },

    #[error("équipement {0} inconnu, adresse MAC introuvable")]
    UnknownDevice(DeviceId),
}

/// Échec d'écriture ou de lecture du stockage des scores
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("erreur d'entrée/sortie: {0}")]
    Io(#[from] std::io::Error),

    #[error("sérialisation impossible: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("délai dépassé lors de l'écriture du score de {0}")]
    Timeout(DeviceId),
}

/// Adresse impossible à rattacher à un équipement
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("aucun équipement pour l'adresse {0}")]
    Unknown(String),

    #[error("collaborateur d'identité indisponible: {0}")]
    Identity(#[from] IdentityError),
}

impl MappingError {
    pub fn unknown_ip(ip: IpAddr) -> Self {
        MappingError::Unknown(ip.to_string())
    }
}

/// Erreur du collaborateur d'identité
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("équipement {0} inconnu")]
    UnknownDevice(DeviceId),

    #[error("délai dépassé")]
    Timeout,

    #[error("service d'identité indisponible: {0}")]
    Unavailable(String),
}

/// Erreur de lecture du flux d'événements leurre
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("lecture du journal impossible: {0}")]
    Io(#[from] std::io::Error),
}

/// Erreur du classificateur externe
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classificateur indisponible: {0}")]
    Unavailable(String),
}

/// Règle de politique invalide
#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("priorité {0} hors de la plage autorisée")]
    Priority(u16),

    #[error("l'adresse MAC source est fixée par le traducteur")]
    EthSrcReserved,

    #[error("protocole {proto} incompatible avec un port {layer}")]
    ProtocolMismatch { proto: u8, layer: &'static str },
}

/// Configuration invalide, seule erreur fatale
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lecture de {path} impossible: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration illisible: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("valeur invalide pour {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
