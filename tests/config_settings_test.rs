use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::RwLock;
use zsentinel::config::{Config, TrustThresholds};
use zsentinel::error::ConfigError;
use zsentinel::models::{PolicyAction, ThreatLevel};
use zsentinel::policy::decide;

#[tokio::test]
async fn test_update_settings() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    let config_arc = Arc::new(RwLock::new(Config::default()));

    // Test 1: Resserrer les seuils de confiance
    {
        let mut config = config_arc.write().await;
        config.trust_thresholds = TrustThresholds {
            quarantine: 40,
            restricted: 60,
            trusted: 80,
        };
        assert!(config.validate().is_ok());
    }

    // Test 2: La décision suit les nouveaux seuils
    {
        let config = config_arc.read().await;
        let (action, _) = decide(75, ThreatLevel::None, &[], &config.trust_thresholds);
        assert_eq!(action, PolicyAction::Redirect);
        let (action, _) = decide(35, ThreatLevel::None, &[], &config.trust_thresholds);
        assert_eq!(action, PolicyAction::Quarantine);
    }

    // Test 3: Sauvegarde puis rechargement
    {
        let mut config = config_arc.write().await;
        config.poll_interval_secs = 5;
        config.switches = vec!["s1".to_string(), "s2".to_string()];
        config.save_to(&path).unwrap();
    }
    let reloaded = Config::load_from(&path).unwrap();
    assert_eq!(reloaded.poll_interval_secs, 5);
    assert_eq!(reloaded.switches.len(), 2);
    assert_eq!(reloaded.trust_thresholds.quarantine, 40);

    // Test 4: Une valeur incohérente est refusée au chargement
    {
        let mut config = config_arc.write().await;
        config.poll_interval_secs = 0;
        config.save_to(&path).unwrap();
    }
    assert!(matches!(
        Config::load_from(&path),
        Err(ConfigError::Invalid { field: "poll_interval_secs", .. })
    ));
}
