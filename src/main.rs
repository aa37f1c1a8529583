use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use pnet::util::MacAddr;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use zsentinel::cli::{Cli, Command};
use zsentinel::config::{Config, CONFIG_FILE};
use zsentinel::deception::JsonLogTail;
use zsentinel::identity::{IdentityProvider, StaticInventory};
use zsentinel::logger::LogMode;
use zsentinel::models::{DeviceId, MatchFields};
use zsentinel::policy::decide;
use zsentinel::service::{Collaborators, Coordinator};
use zsentinel::switch::{MemorySwitch, SwitchControl};
use zsentinel::trust::{JsonTrustStore, TrustStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    // Une configuration invalide est la seule erreur fatale
    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration {} invalide: {}", config_path.display(), e);
            exit(1);
        }
    };

    init_logger(&config);

    let result = match cli.command {
        Command::Start { simulate } => run(config, simulate).await,
        Command::CheckConfig => {
            println!("Configuration {} valide", config_path.display());
            Ok(())
        }
        Command::Decide { trust, threat } => {
            let (action, reason) = decide(trust, threat, &[], &config.trust_thresholds);
            println!("{} ({})", action, reason);
            Ok(())
        }
        Command::History { device, limit } => print_history(&config, &device, limit).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Erreur: {:#}", e);
        exit(1);
    }
}

fn init_logger(config: &Config) {
    match config.log_mode {
        LogMode::File => {
            env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));
        }
        LogMode::SystemdJournal => {
            #[cfg(feature = "systemd")]
            {
                use systemd_journal_logger::JournalLog;

                let log_level = match config.log_level.to_lowercase().as_str() {
                    "trace" => log::LevelFilter::Trace,
                    "debug" => log::LevelFilter::Debug,
                    "warn" => log::LevelFilter::Warn,
                    "error" => log::LevelFilter::Error,
                    _ => log::LevelFilter::Info,
                };

                match JournalLog::new() {
                    Ok(logger) => {
                        if let Err(e) = logger.with_syslog_identifier("zsentinel".to_string()).install() {
                            eprintln!("Erreur lors de l'installation du logger systemd: {}", e);
                            env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));
                        } else {
                            log::set_max_level(log_level);
                            info!("Logger systemd initialisé avec niveau: {}", config.log_level);
                        }
                    }
                    Err(e) => {
                        eprintln!("Erreur lors de l'initialisation du logger systemd: {}", e);
                        env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));
                    }
                }
            }

            #[cfg(not(feature = "systemd"))]
            {
                eprintln!("AVERTISSEMENT: Le mode SystemdJournal n'est pas disponible (feature 'systemd' non activée). Utilisation du logger standard à la place.");
                env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));
            }
        }
    }
}

async fn run(config: Config, simulate: bool) -> anyhow::Result<()> {
    let inventory = match StaticInventory::load(&config.inventory_file) {
        Ok(inventory) => inventory,
        Err(e) => {
            warn!("{:#}, démarrage avec un inventaire vide", e);
            StaticInventory::new(Vec::new())
        }
    };
    let inventory = Arc::new(inventory);

    let switches: Vec<Arc<MemorySwitch>> = config
        .switches
        .iter()
        .map(|id| Arc::new(MemorySwitch::new(id.clone())))
        .collect();

    let trust_store: Arc<dyn TrustStore> = Arc::new(JsonTrustStore::new(&config.trust_store_dir));
    let collaborators = Collaborators {
        switches: switches.iter().map(|s| s.clone() as Arc<dyn SwitchControl>).collect(),
        identity: inventory.clone(),
        deception: Arc::new(JsonLogTail::new(&config.deception_log_path)),
        trust_store,
        classifier: None,
    };

    let poll_interval = config.poll_interval();
    let coordinator = Coordinator::new(config, collaborators).context("Configuration refusée par le coordinateur")?;
    coordinator.start().await;

    let simulation = if simulate {
        info!("Mode simulation: trafic synthétique sur {} commutateur(s)", switches.len());
        Some(tokio::spawn(simulate_traffic(switches, inventory, poll_interval)))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Impossible d'attendre le signal d'arrêt")?;
    info!("Signal d'arrêt reçu");

    if let Some(task) = simulation {
        task.abort();
    }
    coordinator.shutdown().await;

    let health = coordinator.health();
    if health.persistence_degraded {
        warn!("{} score(s) non persisté(s) à l'arrêt", health.pending_writes);
    }
    Ok(())
}

/// Trafic synthétique : débit stable avec des pointes occasionnelles
async fn simulate_traffic(switches: Vec<Arc<MemorySwitch>>, inventory: Arc<StaticInventory>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let devices = match inventory.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Simulation interrompue: {}", e);
                return;
            }
        };

        for device in devices {
            for (switch, fields, packets, bytes) in synthetic_flows(&switches, device.mac, device.ip) {
                switch.add_traffic(fields, packets, bytes);
            }
        }
    }
}

fn synthetic_flows(
    switches: &[Arc<MemorySwitch>],
    mac: MacAddr,
    ip: Option<IpAddr>,
) -> Vec<(Arc<MemorySwitch>, MatchFields, u64, u64)> {
    let mut rng = rand::rng();
    let mut flows = Vec::new();
    if switches.is_empty() {
        return flows;
    }

    // Une pointe environ un cycle sur cinquante
    let burst = rng.random_range(0..50) == 0;
    let flow_count = if burst { 40 } else { rng.random_range(1..4) };
    for _ in 0..flow_count {
        let switch = switches[rng.random_range(0..switches.len())].clone();
        let destination = IpAddr::V4(Ipv4Addr::new(10, 0, rng.random_range(0..2), rng.random_range(1..8)));
        let port = if burst {
            rng.random_range(1..1024)
        } else {
            let usual: [u16; 3] = [443, 8883, 1883];
            usual[rng.random_range(0..usual.len())]
        };
        let packets = if burst {
            rng.random_range(500..2000)
        } else {
            rng.random_range(10..200)
        };
        let fields = MatchFields {
            eth_src: Some(mac),
            ip_src: ip,
            ip_dst: Some(destination),
            tcp_dst: Some(port),
            ip_proto: Some(6),
            ..Default::default()
        };
        flows.push((switch, fields, packets, packets * rng.random_range(60..1400)));
    }
    flows
}

async fn print_history(config: &Config, device: &str, limit: usize) -> anyhow::Result<()> {
    let store = JsonTrustStore::new(&config.trust_store_dir);
    let device_id = DeviceId::new(device);
    let state = store
        .load(&device_id)
        .await
        .with_context(|| format!("Impossible de lire le score de {}", device_id))?
        .with_context(|| format!("Aucun score persisté pour {}", device_id))?;

    println!("{}: score {}", device_id, state.record.score);
    let skip = state.history.len().saturating_sub(limit);
    for entry in state.history.iter().skip(skip) {
        let at = chrono::DateTime::<chrono::Local>::from(entry.timestamp);
        println!(
            "  {} {:>3} ({:+}) {}",
            at.format("%Y-%m-%d %H:%M:%S"),
            entry.score,
            entry.delta,
            entry.reason
        );
    }
    Ok(())
}
