//! Collaborateur d'identité et cache de résolution des adresses
//!
//! L'inventaire des équipements appartient au collaborateur d'identité. Le cœur
//! n'en garde qu'un cache en lecture, indexé par identifiant, MAC et IP.

use crate::error::{IdentityError, MappingError};
use crate::models::{Device, DeviceId, DeviceStatus};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;

/// État du certificat d'un équipement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Valid,
    Expired,
    Revoked,
}

/// Adresse observée sur le réseau
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Mac(MacAddr),
    Ip(IpAddr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Mac(mac) => write!(f, "{}", mac),
            Address::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn lookup_device_by_address(&self, address: &Address) -> Result<Option<DeviceId>, IdentityError>;

    async fn credential_status(&self, device_id: &DeviceId) -> Result<CredentialStatus, IdentityError>;

    async fn record_ip_mapping(&self, device_id: &DeviceId, ip: IpAddr) -> Result<(), IdentityError>;

    async fn device(&self, device_id: &DeviceId) -> Result<Option<Device>, IdentityError>;

    /// Équipements enrôlés
    async fn devices(&self) -> Result<Vec<Device>, IdentityError>;
}

/// Entrée du fichier d'inventaire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    #[serde(flatten)]
    pub device: Device,
    pub credential: CredentialStatus,
}

/// Collaborateur d'identité adossé à un inventaire statique
pub struct StaticInventory {
    entries: DashMap<DeviceId, InventoryEntry>,
}

impl StaticInventory {
    pub fn new(entries: Vec<InventoryEntry>) -> Self {
        let map = DashMap::new();
        for entry in entries {
            map.insert(entry.device.id.clone(), entry);
        }
        Self { entries: map }
    }

    /// Charge l'inventaire depuis un fichier JSON
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Impossible de lire l'inventaire {}", path.display()))?;
        let entries: Vec<InventoryEntry> =
            serde_json::from_str(&content).context("Impossible de désérialiser l'inventaire")?;
        Ok(Self::new(entries))
    }

    pub fn set_credential(&self, device_id: &DeviceId, status: CredentialStatus) {
        if let Some(mut entry) = self.entries.get_mut(device_id) {
            entry.credential = status;
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticInventory {
    async fn lookup_device_by_address(&self, address: &Address) -> Result<Option<DeviceId>, IdentityError> {
        let found = self.entries.iter().find(|entry| match address {
            Address::Mac(mac) => entry.device.mac == *mac,
            Address::Ip(ip) => entry.device.ip == Some(*ip),
        });
        Ok(found.map(|entry| entry.key().clone()))
    }

    async fn credential_status(&self, device_id: &DeviceId) -> Result<CredentialStatus, IdentityError> {
        self.entries
            .get(device_id)
            .map(|entry| entry.credential)
            .ok_or_else(|| IdentityError::UnknownDevice(device_id.clone()))
    }

    async fn record_ip_mapping(&self, device_id: &DeviceId, ip: IpAddr) -> Result<(), IdentityError> {
        let mut entry = self
            .entries
            .get_mut(device_id)
            .ok_or_else(|| IdentityError::UnknownDevice(device_id.clone()))?;
        entry.device.ip = Some(ip);
        Ok(())
    }

    async fn device(&self, device_id: &DeviceId) -> Result<Option<Device>, IdentityError> {
        Ok(self.entries.get(device_id).map(|entry| entry.device.clone()))
    }

    async fn devices(&self) -> Result<Vec<Device>, IdentityError> {
        Ok(self.entries.iter().map(|entry| entry.device.clone()).collect())
    }
}

/// Cache de résolution adresse → équipement
///
/// Les échecs de résolution ne sont pas mis en cache afin qu'un équipement
/// enrôlé entre deux cycles soit reconnu au cycle suivant.
pub struct DeviceDirectory {
    provider: Arc<dyn IdentityProvider>,
    call_timeout: Duration,
    by_id: DashMap<DeviceId, Device>,
    by_mac: DashMap<MacAddr, DeviceId>,
    by_ip: DashMap<IpAddr, DeviceId>,
    /// Dernière activité observée par la collecte
    last_activity: DashMap<DeviceId, SystemTime>,
    /// Premier moment où le cœur a connu l'équipement
    first_known: DashMap<DeviceId, SystemTime>,
}

impl DeviceDirectory {
    pub fn new(provider: Arc<dyn IdentityProvider>, call_timeout: Duration) -> Self {
        Self {
            provider,
            call_timeout,
            by_id: DashMap::new(),
            by_mac: DashMap::new(),
            by_ip: DashMap::new(),
            last_activity: DashMap::new(),
            first_known: DashMap::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    pub async fn resolve_mac(&self, mac: MacAddr) -> Result<DeviceId, MappingError> {
        if let Some(id) = self.by_mac.get(&mac) {
            return Ok(id.clone());
        }
        let id = self.lookup(Address::Mac(mac)).await?;
        self.by_mac.insert(mac, id.clone());
        Ok(id)
    }

    pub async fn resolve_ip(&self, ip: IpAddr) -> Result<DeviceId, MappingError> {
        if let Some(id) = self.by_ip.get(&ip) {
            return Ok(id.clone());
        }
        let id = self.lookup(Address::Ip(ip)).await?;
        self.by_ip.insert(ip, id.clone());
        Ok(id)
    }

    async fn lookup(&self, address: Address) -> Result<DeviceId, MappingError> {
        let result = timeout(self.call_timeout, self.provider.lookup_device_by_address(&address))
            .await
            .map_err(|_| IdentityError::Timeout)??;
        let id = result.ok_or_else(|| MappingError::Unknown(address.to_string()))?;
        self.remember(&id);
        Ok(id)
    }

    /// Équipement en cache, sinon interrogé auprès du collaborateur
    pub async fn device(&self, device_id: &DeviceId) -> Option<Device> {
        if let Some(device) = self.by_id.get(device_id) {
            return Some(device.clone());
        }
        match timeout(self.call_timeout, self.provider.device(device_id)).await {
            Ok(Ok(Some(device))) => {
                self.cache_device(&device);
                Some(device)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("Impossible de récupérer l'équipement {}: {}", device_id, e);
                None
            }
            Err(_) => {
                warn!("Délai dépassé lors de la récupération de l'équipement {}", device_id);
                None
            }
        }
    }

    pub async fn mac_of(&self, device_id: &DeviceId) -> Option<MacAddr> {
        self.device(device_id).await.map(|device| device.mac)
    }

    /// Associe une IP apprise à l'équipement, signalée seulement si elle change
    pub async fn learn_ip(&self, device_id: &DeviceId, ip: IpAddr) {
        if self.by_ip.get(&ip).map(|known| known.value() == device_id).unwrap_or(false) {
            return;
        }
        self.by_ip.insert(ip, device_id.clone());
        if let Some(mut device) = self.by_id.get_mut(device_id) {
            device.ip = Some(ip);
        }

        debug!("Nouvelle adresse {} apprise pour {}", ip, device_id);
        match timeout(self.call_timeout, self.provider.record_ip_mapping(device_id, ip)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Impossible d'enregistrer l'adresse {} de {}: {}", ip, device_id, e),
            Err(_) => warn!("Délai dépassé lors de l'enregistrement de l'adresse {} de {}", ip, device_id),
        }
    }

    /// Liste des équipements actifs, depuis le collaborateur ou le cache
    pub async fn roster(&self) -> Vec<DeviceId> {
        match timeout(self.call_timeout, self.provider.devices()).await {
            Ok(Ok(devices)) => devices
                .into_iter()
                .filter(|device| device.status != DeviceStatus::Revoked)
                .map(|device| {
                    self.cache_device(&device);
                    device.id
                })
                .collect(),
            Ok(Err(e)) => {
                warn!("Inventaire indisponible, utilisation du cache: {}", e);
                self.by_id.iter().map(|entry| entry.key().clone()).collect()
            }
            Err(_) => {
                warn!("Délai dépassé lors de la lecture de l'inventaire, utilisation du cache");
                self.by_id.iter().map(|entry| entry.key().clone()).collect()
            }
        }
    }

    pub fn mark_active(&self, device_id: &DeviceId, at: SystemTime) {
        self.last_activity.insert(device_id.clone(), at);
    }

    /// Dernière activité, ou premier contact si aucun trafic n'a été vu
    pub fn last_activity(&self, device_id: &DeviceId) -> Option<SystemTime> {
        self.last_activity
            .get(device_id)
            .map(|at| *at)
            .or_else(|| self.first_known.get(device_id).map(|at| *at))
    }

    fn cache_device(&self, device: &Device) {
        self.by_mac.insert(device.mac, device.id.clone());
        if let Some(ip) = device.ip {
            self.by_ip.entry(ip).or_insert_with(|| device.id.clone());
        }
        self.by_id.insert(device.id.clone(), device.clone());
        self.remember(&device.id);
    }

    fn remember(&self, device_id: &DeviceId) {
        self.first_known
            .entry(device_id.clone())
            .or_insert_with(SystemTime::now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Arc<StaticInventory> {
        Arc::new(StaticInventory::new(vec![InventoryEntry {
            device: Device {
                id: DeviceId::from("cam-1"),
                mac: MacAddr::new(0xaa, 0, 0, 0, 0, 1),
                ip: Some("10.0.0.11".parse().unwrap()),
                status: DeviceStatus::Active,
            },
            credential: CredentialStatus::Valid,
        }]))
    }

    #[tokio::test]
    async fn test_resolve_mac_and_ip() {
        let directory = DeviceDirectory::new(inventory(), Duration::from_secs(1));
        let id = directory.resolve_mac(MacAddr::new(0xaa, 0, 0, 0, 0, 1)).await.unwrap();
        assert_eq!(id.as_str(), "cam-1");

        let id = directory.resolve_ip("10.0.0.11".parse().unwrap()).await.unwrap();
        assert_eq!(id.as_str(), "cam-1");

        let unknown = directory.resolve_ip("10.0.0.99".parse().unwrap()).await;
        assert!(matches!(unknown, Err(MappingError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_learn_ip_updates_provider() {
        let provider = inventory();
        let directory = DeviceDirectory::new(provider.clone(), Duration::from_secs(1));
        let id = DeviceId::from("cam-1");
        let ip: IpAddr = "10.0.0.42".parse().unwrap();

        directory.learn_ip(&id, ip).await;
        assert_eq!(directory.resolve_ip(ip).await.unwrap(), id);
        let device = provider.device(&id).await.unwrap().unwrap();
        assert_eq!(device.ip, Some(ip));
    }

    #[tokio::test]
    async fn test_last_activity_falls_back_to_first_contact() {
        let directory = DeviceDirectory::new(inventory(), Duration::from_secs(1));
        let id = DeviceId::from("cam-1");
        assert!(directory.last_activity(&id).is_none());

        directory.roster().await;
        assert!(directory.last_activity(&id).is_some());
    }
}
