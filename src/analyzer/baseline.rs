use crate::models::{BehavioralBaseline, DeviceId, FlowWindowStats};
use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::SystemTime;

/// Poids en dessous duquel une destination ou un port est oublié
const MIN_WEIGHT: f64 = 0.01;

/// Profils de référence par équipement
///
/// Chaque profil est raffiné par moyenne mobile exponentielle :
/// `nouveau = α·observé + (1-α)·ancien`.
pub struct BaselineStore {
    baselines: DashMap<DeviceId, BehavioralBaseline>,
    alpha: f64,
    top_n: usize,
}

impl BaselineStore {
    pub fn new(alpha: f64, top_n: usize) -> Self {
        Self {
            baselines: DashMap::new(),
            alpha,
            top_n,
        }
    }

    /// Profil fourni à l'enrôlement
    pub fn seed(&self, baseline: BehavioralBaseline) {
        debug!(
            "Profil de référence initial pour {}: {:.1} pps, {:.1} B/s",
            baseline.device_id, baseline.avg_pps, baseline.avg_bps
        );
        self.baselines.insert(baseline.device_id.clone(), baseline);
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<BehavioralBaseline> {
        self.baselines.get(device_id).map(|b| b.clone())
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.baselines.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Intègre une observation au profil de l'équipement
    ///
    /// Sans profil existant, l'observation devient le profil initial.
    pub fn observe(&self, stats: &FlowWindowStats) -> BehavioralBaseline {
        let mut entry = self
            .baselines
            .entry(stats.device_id.clone())
            .or_insert_with(|| BehavioralBaseline::new(stats.device_id.clone()));
        let baseline = entry.value_mut();

        let pps = stats.packets_per_sec();
        let bps = stats.bytes_per_sec();
        let destinations = stats.destinations.len() as f64;
        let ports = stats.ports.len() as f64;

        if baseline.samples == 0 && baseline.has_no_traffic() {
            baseline.avg_pps = pps;
            baseline.avg_bps = bps;
            baseline.avg_destinations = destinations;
            baseline.avg_ports = ports;
        } else {
            baseline.avg_pps = ema(self.alpha, pps, baseline.avg_pps);
            baseline.avg_bps = ema(self.alpha, bps, baseline.avg_bps);
            baseline.avg_destinations = ema(self.alpha, destinations, baseline.avg_destinations);
            baseline.avg_ports = ema(self.alpha, ports, baseline.avg_ports);
        }

        update_weights(&mut baseline.destination_weights, stats.destinations.iter().copied(), self.alpha);
        update_weights(&mut baseline.port_weights, stats.ports.iter().copied(), self.alpha);
        baseline.common_destinations = top_n(&baseline.destination_weights, self.top_n);
        baseline.common_ports = top_n(&baseline.port_weights, self.top_n);

        baseline.samples += 1;
        baseline.updated_at = SystemTime::now();
        baseline.clone()
    }
}

fn ema(alpha: f64, observed: f64, old: f64) -> f64 {
    alpha * observed + (1.0 - alpha) * old
}

/// Fréquence lissée : 1 pour une clé vue pendant la fenêtre, 0 sinon
fn update_weights<K, I>(weights: &mut HashMap<K, f64>, seen: I, alpha: f64)
where
    K: Eq + Hash + Copy,
    I: Iterator<Item = K>,
{
    for weight in weights.values_mut() {
        *weight *= 1.0 - alpha;
    }
    for key in seen {
        *weights.entry(key).or_insert(0.0) += alpha;
    }
    weights.retain(|_, weight| *weight >= MIN_WEIGHT);
}

fn top_n<K: Copy + Ord>(weights: &HashMap<K, f64>, n: usize) -> Vec<K> {
    let mut ranked: Vec<(K, f64)> = weights.iter().map(|(k, w)| (*k, *w)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k).collect()
}
