//! Collecte des statistiques de flux et détection d'anomalies
//!
//! Le collecteur interroge tous les commutateurs à intervalle fixe, rattache
//! chaque flux à un équipement par son adresse MAC source et produit une
//! fenêtre de trafic par équipement.

pub mod anomaly;
pub mod baseline;
pub mod window;

use crate::error::CollectionError;
use crate::identity::DeviceDirectory;
use crate::models::{DeviceId, FlowWindowStats, MatchFields};
use crate::switch::{FlowStatEntry, SwitchControl};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::time::timeout;

pub use anomaly::{detect, AlertLog};
pub use baseline::BaselineStore;
pub use window::{CycleSample, DeviceWindow};

/// Compteurs vus au cycle précédent, par commutateur et par flux
type CounterKey = (String, MatchFields);

pub struct FlowStatsCollector {
    switches: Vec<Arc<dyn SwitchControl>>,
    directory: Arc<DeviceDirectory>,
    window: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
    previous: DashMap<CounterKey, (u64, u64)>,
    windows: DashMap<DeviceId, DeviceWindow>,
    last_cycle: Mutex<Option<Instant>>,
}

impl FlowStatsCollector {
    pub fn new(
        switches: Vec<Arc<dyn SwitchControl>>,
        directory: Arc<DeviceDirectory>,
        window: Duration,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            switches,
            directory,
            window,
            poll_interval,
            poll_timeout,
            previous: DashMap::new(),
            windows: DashMap::new(),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }

    /// Exécute un cycle de collecte et renvoie la fenêtre de chaque équipement actif
    ///
    /// Un commutateur injoignable ou trop lent est ignoré pour ce cycle.
    pub async fn collect(&self) -> Vec<FlowWindowStats> {
        let now = SystemTime::now();
        let elapsed = self.cycle_elapsed();

        let polls = join_all(self.switches.iter().map(|switch| self.poll(switch.clone()))).await;

        let mut cycle: HashMap<DeviceId, CycleSample> = HashMap::new();
        for (switch_id, result) in polls {
            match result {
                Ok(entries) => self.accumulate(&switch_id, entries, elapsed, &mut cycle).await,
                Err(e) => warn!("Cycle de collecte ignoré pour {}: {}", switch_id, e),
            }
        }

        for (device_id, sample) in &cycle {
            for ip in &sample.sources {
                self.directory.learn_ip(device_id, *ip).await;
            }
            self.directory.mark_active(device_id, now);
        }

        // Les équipements silencieux reçoivent un cycle vide pour que leur débit retombe
        for mut entry in self.windows.iter_mut() {
            if !cycle.contains_key(entry.key()) {
                entry.value_mut().push(now, elapsed, CycleSample::default());
            }
        }
        for (device_id, sample) in cycle {
            self.windows
                .entry(device_id)
                .or_default()
                .push(now, elapsed, sample);
        }

        let mut snapshots = Vec::new();
        for mut entry in self.windows.iter_mut() {
            entry.value_mut().expire(now, self.window);
            if entry.value().has_traffic() {
                snapshots.push(entry.value().snapshot(entry.key(), now));
            }
        }
        self.windows.retain(|_, window| window.has_traffic());

        debug!("Cycle de collecte terminé: {} équipement(s) actif(s)", snapshots.len());
        snapshots
    }

    fn cycle_elapsed(&self) -> Duration {
        let now = Instant::now();
        match self.last_cycle.lock() {
            Ok(mut last) => {
                let elapsed = last.map(|at| now.duration_since(at)).unwrap_or(self.poll_interval);
                *last = Some(now);
                elapsed
            }
            Err(_) => self.poll_interval,
        }
    }

    async fn poll(&self, switch: Arc<dyn SwitchControl>) -> (String, Result<Vec<FlowStatEntry>, CollectionError>) {
        let switch_id = switch.id().to_string();
        let result = match timeout(self.poll_timeout, switch.flow_stats()).await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(source)) => Err(CollectionError::Switch {
                switch: switch_id.clone(),
                source,
            }),
            Err(_) => Err(CollectionError::Timeout {
                switch: switch_id.clone(),
            }),
        };
        (switch_id, result)
    }

    async fn accumulate(
        &self,
        switch_id: &str,
        entries: Vec<FlowStatEntry>,
        elapsed: Duration,
        cycle: &mut HashMap<DeviceId, CycleSample>,
    ) {
        let mut seen: HashSet<MatchFields> = HashSet::new();

        for entry in entries {
            let Some(mac) = entry.match_fields.eth_src else {
                continue;
            };
            seen.insert(entry.match_fields.clone());

            let key = (switch_id.to_string(), entry.match_fields.clone());
            let previous = self.previous.insert(key, (entry.packet_count, entry.byte_count));
            let (packets, bytes) = counter_delta(&entry, previous, elapsed);
            if packets == 0 && bytes == 0 {
                continue;
            }

            let device_id = match self.directory.resolve_mac(mac).await {
                Ok(id) => id,
                Err(e) => {
                    debug!("Flux {} ignoré sur {}: {}", mac, switch_id, e);
                    continue;
                }
            };

            let mut sample = CycleSample {
                packets,
                bytes,
                ..Default::default()
            };
            if let Some(dst) = entry.match_fields.ip_dst {
                sample.destinations.insert(dst);
            }
            if let Some(port) = entry.match_fields.destination_port() {
                sample.ports.insert(port);
            }
            if let Some(src) = entry.match_fields.ip_src {
                sample.sources.insert(src);
            }
            cycle.entry(device_id).or_default().merge(sample);
        }

        // Oublier les flux expirés sur ce commutateur
        self.previous
            .retain(|(switch, fields), _| switch != switch_id || seen.contains(fields));
    }
}

/// Trafic apparu depuis le cycle précédent
///
/// Un flux vu pour la première fois compte en entier s'il est plus récent que
/// le cycle, sinon au prorata de la durée du cycle.
fn counter_delta(entry: &FlowStatEntry, previous: Option<(u64, u64)>, elapsed: Duration) -> (u64, u64) {
    match previous {
        Some((packets, bytes)) if entry.packet_count >= packets && entry.byte_count >= bytes => {
            (entry.packet_count - packets, entry.byte_count - bytes)
        }
        // Compteurs remis à zéro par le commutateur
        Some(_) => (entry.packet_count, entry.byte_count),
        None if entry.duration <= elapsed => (entry.packet_count, entry.byte_count),
        None => {
            let share = elapsed.as_secs_f64() / entry.duration.as_secs_f64();
            (
                (entry.packet_count as f64 * share).round() as u64,
                (entry.byte_count as f64 * share).round() as u64,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::util::MacAddr;

    fn entry(packets: u64, bytes: u64, duration_secs: u64) -> FlowStatEntry {
        FlowStatEntry {
            match_fields: MatchFields::from_mac(MacAddr::new(0, 0, 0, 0, 0, 1)),
            packet_count: packets,
            byte_count: bytes,
            duration: Duration::from_secs(duration_secs),
        }
    }

    #[test]
    fn test_counter_delta() {
        let elapsed = Duration::from_secs(10);
        assert_eq!(counter_delta(&entry(100, 1000, 5), None, elapsed), (100, 1000));
        assert_eq!(counter_delta(&entry(100, 1000, 40), None, elapsed), (25, 250));
        assert_eq!(counter_delta(&entry(150, 1500, 50), Some((100, 1000)), elapsed), (50, 500));
        // Remise à zéro
        assert_eq!(counter_delta(&entry(20, 200, 5), Some((100, 1000)), elapsed), (20, 200));
    }
}
