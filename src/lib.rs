//! Bibliothèque ZSentinel de contrôle d'accès réseau adaptatif pour l'IoT
//!
//! Chaque équipement reçoit un score de confiance qui évolue avec son
//! comportement observé sur les commutateurs, ses attestations et les
//! événements de l'environnement leurre. Le score et le niveau de menace
//! déterminent l'action réseau appliquée à l'équipement.

// Modèles et socle
pub mod models; // Structures de données partagées
pub mod error;  // Erreurs typées par composant
pub mod config; // Configuration du système
pub mod logger; // Journal des événements de sécurité

// Plan de données
pub mod switch;   // Accès aux commutateurs
pub mod identity; // Inventaire et correspondance adresse/équipement

// Boucle de contrôle
pub mod analyzer;  // Statistiques de flux et détection d'anomalies
pub mod trust;     // Scores de confiance et attestation
pub mod threat;    // Niveaux de menace et classification
pub mod policy;    // Décision et traduction en règles de flux
pub mod deception; // Retour de l'environnement leurre

pub mod service; // Coordinateur des cycles
pub mod cli;     // Interface en ligne de commande

pub use config::Config;
pub use logger::{EventJournal, LogMode};
pub use models::{DeviceId, PolicyAction, PolicyDecision, ThreatLevel, TrustLevel};
pub use service::{Collaborators, Coordinator, HealthStatus};
