use crate::models::{DeviceId, FlowWindowStats};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Trafic d'un équipement pendant un cycle de collecte, tous commutateurs confondus
#[derive(Debug, Clone, Default)]
pub struct CycleSample {
    pub packets: u64,
    pub bytes: u64,
    pub destinations: HashSet<IpAddr>,
    pub ports: HashSet<u16>,
    pub sources: HashSet<IpAddr>,
}

impl CycleSample {
    pub fn merge(&mut self, other: CycleSample) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.destinations.extend(other.destinations);
        self.ports.extend(other.ports);
        self.sources.extend(other.sources);
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0 && self.bytes == 0
    }
}

struct TimedSample {
    end: SystemTime,
    span: Duration,
    sample: CycleSample,
}

/// Fenêtre glissante des cycles d'un équipement
pub struct DeviceWindow {
    samples: VecDeque<TimedSample>,
}

impl DeviceWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Ajoute le cycle terminé à `end` et qui a duré `span`
    pub fn push(&mut self, end: SystemTime, span: Duration, sample: CycleSample) {
        self.samples.push_back(TimedSample { end, span, sample });
    }

    /// Oublie les cycles sortis de la fenêtre
    pub fn expire(&mut self, now: SystemTime, window: Duration) {
        while let Some(front) = self.samples.front() {
            let age = now.duration_since(front.end).unwrap_or(Duration::ZERO);
            if age + front.span > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn has_traffic(&self) -> bool {
        self.samples.iter().any(|s| !s.sample.is_empty())
    }

    /// Statistiques agrégées sur les cycles encore dans la fenêtre
    pub fn snapshot(&self, device_id: &DeviceId, now: SystemTime) -> FlowWindowStats {
        let covered: Duration = self.samples.iter().map(|s| s.span).sum();
        let mut stats = FlowWindowStats {
            device_id: device_id.clone(),
            window_start: now - covered,
            window_end: now,
            packet_count: 0,
            byte_count: 0,
            destinations: HashSet::new(),
            ports: HashSet::new(),
        };
        for timed in &self.samples {
            stats.packet_count += timed.sample.packets;
            stats.byte_count += timed.sample.bytes;
            stats.destinations.extend(timed.sample.destinations.iter().copied());
            stats.ports.extend(timed.sample.ports.iter().copied());
        }
        stats
    }
}

impl Default for DeviceWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(packets: u64) -> CycleSample {
        CycleSample {
            packets,
            bytes: packets * 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_window_expires_old_cycles() {
        let mut window = DeviceWindow::new();
        let start = SystemTime::now();
        let step = Duration::from_secs(10);
        for i in 0..8u32 {
            window.push(start + step * (i + 1), step, sample(100));
        }
        let now = start + step * 8;
        window.expire(now, Duration::from_secs(60));

        let stats = window.snapshot(&DeviceId::from("cam-1"), now);
        assert_eq!(stats.packet_count, 600);
        assert_eq!(stats.duration(), Duration::from_secs(60));
        assert!((stats.packets_per_sec() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_sums_counters() {
        let mut a = sample(10);
        a.merge(sample(15));
        assert_eq!(a.packets, 25);
        assert_eq!(a.bytes, 25 * 64);
    }
}
