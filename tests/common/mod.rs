#![allow(dead_code)]

use pnet::util::MacAddr;
use std::path::Path;
use std::sync::Arc;
use zsentinel::deception::JsonLogTail;
use zsentinel::identity::{CredentialStatus, IdentityProvider, InventoryEntry, StaticInventory};
use zsentinel::models::{Device, DeviceId, DeviceStatus};
use zsentinel::switch::{MemorySwitch, SwitchControl};
use zsentinel::trust::JsonTrustStore;
use zsentinel::{Collaborators, Config, Coordinator};

pub const CAMERA_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01);
pub const CAMERA_IP: &str = "10.0.0.11";

pub fn camera_id() -> DeviceId {
    DeviceId::from("cam-1")
}

pub fn camera(credential: CredentialStatus) -> InventoryEntry {
    InventoryEntry {
        device: Device {
            id: camera_id(),
            mac: CAMERA_MAC,
            ip: Some(CAMERA_IP.parse().unwrap()),
            status: DeviceStatus::Active,
        },
        credential,
    }
}

/// Configuration de test : fichiers dans `dir`, valeurs par défaut ailleurs
pub fn test_config(dir: &Path) -> Config {
    Config {
        trust_store_dir: dir.join("trust").display().to_string(),
        deception_log_path: dir.join("cowrie.json").display().to_string(),
        journal_file: dir.join("events.log").display().to_string(),
        install_retry_backoff_ms: 1,
        ..Config::default()
    }
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub switches: Vec<Arc<MemorySwitch>>,
    pub inventory: Arc<StaticInventory>,
}

pub fn harness(config: Config, entries: Vec<InventoryEntry>, switch_ids: &[&str]) -> Harness {
    let inventory = Arc::new(StaticInventory::new(entries));
    harness_with_identity(config, inventory.clone(), inventory, switch_ids)
}

/// Comme `harness`, avec un collaborateur d'identité fourni par le test
pub fn harness_with_identity(
    config: Config,
    inventory: Arc<StaticInventory>,
    identity: Arc<dyn IdentityProvider>,
    switch_ids: &[&str],
) -> Harness {
    let switches: Vec<Arc<MemorySwitch>> = switch_ids.iter().map(|id| Arc::new(MemorySwitch::new(*id))).collect();
    let collaborators = Collaborators {
        switches: switches.iter().map(|s| s.clone() as Arc<dyn SwitchControl>).collect(),
        identity,
        deception: Arc::new(JsonLogTail::new(&config.deception_log_path)),
        trust_store: Arc::new(JsonTrustStore::new(&config.trust_store_dir)),
        classifier: None,
    };
    let coordinator = Coordinator::new_log_only(config, collaborators).unwrap();
    Harness {
        coordinator,
        switches,
        inventory,
    }
}
