//! Traduction des politiques en règles de commutation
//!
//! Toute installation de règle passe par ce module. Les opérations d'un même
//! équipement sont sérialisées par son verrou ; deux équipements différents
//! ne se bloquent jamais.

use super::rules::{PolicyRule, RuleAction};
use crate::error::{InstallError, SwitchError};
use crate::identity::DeviceDirectory;
use crate::logger::EventJournal;
use crate::models::{priority, DeviceId, MatchFields, MitigationKind, MitigationRule, PolicyAction};
use crate::switch::{cookie_for, FlowAction, FlowRule, SwitchControl};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use pnet::util::MacAddr;
use rand::Rng;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

/// Redirection active d'un équipement
#[derive(Debug, Clone, Serialize)]
pub struct RedirectState {
    pub device_id: DeviceId,
    pub rule: FlowRule,
    pub reason: String,
    pub installed_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    Installed,
    /// Même redirection déjà active
    Unchanged,
    /// Redirection active remplacée pour un autre motif
    Replaced,
}

/// Règle qu'un commutateur a refusée malgré la nouvelle tentative
#[derive(Debug, Clone, Serialize)]
pub struct EnforcementFailure {
    pub switch: String,
    pub rule: FlowRule,
    pub reason: String,
    pub since: SystemTime,
}

#[derive(Default)]
struct DeviceEnforcement {
    action: Option<PolicyAction>,
    /// Règle de refus ou de quarantaine en place
    block_rule: Option<FlowRule>,
    policy_rules: Vec<FlowRule>,
}

pub struct SdnPolicyTranslator {
    switches: Vec<Arc<dyn SwitchControl>>,
    directory: Arc<DeviceDirectory>,
    journal: Arc<EventJournal>,
    honeypot_port: u32,
    call_timeout: Duration,
    retry_backoff: Duration,
    devices: DashMap<DeviceId, Arc<Mutex<DeviceEnforcement>>>,
    redirects: DashMap<DeviceId, RedirectState>,
    source_locks: DashMap<IpAddr, Arc<Mutex<()>>>,
    mitigations: DashMap<String, (MitigationRule, Option<FlowRule>)>,
    failures: DashMap<(String, FlowRule), EnforcementFailure>,
}

impl SdnPolicyTranslator {
    pub fn new(
        switches: Vec<Arc<dyn SwitchControl>>,
        directory: Arc<DeviceDirectory>,
        journal: Arc<EventJournal>,
        honeypot_port: u32,
        call_timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            switches,
            directory,
            journal,
            honeypot_port,
            call_timeout,
            retry_backoff,
            devices: DashMap::new(),
            redirects: DashMap::new(),
            source_locks: DashMap::new(),
            mitigations: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Installe une liste de règles pour un équipement
    ///
    /// L'adresse MAC de l'équipement est ajoutée à chaque règle et un refus
    /// implicite de priorité minimale termine la liste. Les règles déjà en
    /// place ne sont pas réinstallées ; celles qui ont disparu de la liste
    /// sont retirées.
    pub async fn install_policy(&self, device_id: &DeviceId, rules: &[PolicyRule]) -> Result<usize, InstallError> {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        let mac = self.device_mac(device_id).await?;

        let cookie = cookie_for(device_id.as_str(), "policy");
        let mut wanted: Vec<FlowRule> = rules
            .iter()
            .map(|rule| FlowRule {
                cookie,
                priority: rule.priority(),
                match_fields: MatchFields {
                    eth_src: Some(mac),
                    ..rule.match_fields().clone()
                },
                action: match rule.action() {
                    RuleAction::Allow => FlowAction::Normal,
                    RuleAction::Deny => FlowAction::Drop,
                },
            })
            .collect();
        wanted.push(FlowRule {
            cookie,
            priority: priority::DEFAULT_DENY,
            match_fields: MatchFields::from_mac(mac),
            action: FlowAction::Drop,
        });

        let stale: Vec<FlowRule> = state
            .policy_rules
            .iter()
            .filter(|rule| !wanted.contains(rule))
            .cloned()
            .collect();
        for rule in &stale {
            self.remove_everywhere(rule).await;
        }

        let mut installed = Vec::new();
        let mut first_error = None;
        let mut added = 0;
        for rule in wanted {
            if state.policy_rules.contains(&rule) {
                installed.push(rule);
                continue;
            }
            match self.push_rule(&rule).await {
                Ok(()) => {
                    added += 1;
                    installed.push(rule);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        state.policy_rules = installed;

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Politique de {} appliquée: {} nouvelle(s) règle(s)", device_id, added);
                Ok(added)
            }
        }
    }

    /// Retire la liste de règles d'un équipement
    pub async fn remove_policy(&self, device_id: &DeviceId) {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;
        for rule in std::mem::take(&mut state.policy_rules) {
            self.remove_everywhere(&rule).await;
        }
    }

    /// Applique une action grossière à un équipement
    ///
    /// Réappliquer l'action en place ne touche pas aux commutateurs.
    pub async fn apply_action(&self, device_id: &DeviceId, action: PolicyAction, reason: &str) -> Result<(), InstallError> {
        let cell = self.cell(device_id);
        let mut state = cell.lock().await;

        let result = match action {
            PolicyAction::Allow => {
                self.clear_redirect_locked(device_id).await;
                self.clear_block(&mut state).await;
                Ok(())
            }
            PolicyAction::Redirect => {
                self.clear_block(&mut state).await;
                self.redirect_locked(device_id, reason).await.map(|_| ())
            }
            PolicyAction::Deny => {
                self.clear_redirect_locked(device_id).await;
                self.set_block(device_id, &mut state, priority::DENY, "deny").await
            }
            PolicyAction::Quarantine => {
                self.clear_redirect_locked(device_id).await;
                self.set_block(device_id, &mut state, priority::QUARANTINE, "quarantine").await
            }
        };

        if result.is_ok() && state.action != Some(action) {
            info!("Action {} appliquée à {}: {}", action, device_id, reason);
            state.action = Some(action);
        }
        result
    }

    /// Redirige le trafic de l'équipement vers l'environnement leurre
    pub async fn redirect(&self, device_id: &DeviceId, reason: &str) -> Result<RedirectOutcome, InstallError> {
        let cell = self.cell(device_id);
        let _state = cell.lock().await;
        self.redirect_locked(device_id, reason).await
    }

    /// Retire la redirection de l'équipement ; réussit même si elle n'existe plus
    pub async fn clear_redirect(&self, device_id: &DeviceId) {
        let cell = self.cell(device_id);
        let _state = cell.lock().await;
        self.clear_redirect_locked(device_id).await;
    }

    async fn redirect_locked(&self, device_id: &DeviceId, reason: &str) -> Result<RedirectOutcome, InstallError> {
        let existing = self.redirects.get(device_id).map(|state| state.clone());
        let replaced = match existing {
            Some(current) if current.reason == reason => {
                debug!("Redirection de {} déjà active ({})", device_id, reason);
                return Ok(RedirectOutcome::Unchanged);
            }
            Some(current) => {
                info!(
                    "Remplacement de la redirection de {}: '{}' -> '{}'",
                    device_id, current.reason, reason
                );
                self.remove_everywhere(&current.rule).await;
                self.redirects.remove(device_id);
                true
            }
            None => false,
        };

        let mac = self.device_mac(device_id).await?;
        let rule = FlowRule {
            cookie: cookie_for(device_id.as_str(), "redirect"),
            priority: priority::REDIRECT,
            match_fields: MatchFields::from_mac(mac),
            action: FlowAction::Forward(self.honeypot_port),
        };
        self.push_rule(&rule).await?;

        self.redirects.insert(
            device_id.clone(),
            RedirectState {
                device_id: device_id.clone(),
                rule,
                reason: reason.to_string(),
                installed_at: SystemTime::now(),
            },
        );
        info!("Trafic de {} redirigé vers le port {}: {}", device_id, self.honeypot_port, reason);

        Ok(if replaced {
            RedirectOutcome::Replaced
        } else {
            RedirectOutcome::Installed
        })
    }

    async fn clear_redirect_locked(&self, device_id: &DeviceId) {
        match self.redirects.remove(device_id) {
            Some((_, state)) => {
                self.remove_everywhere(&state.rule).await;
                info!("Redirection de {} retirée", device_id);
            }
            None => debug!("Aucune redirection active pour {}", device_id),
        }
    }

    async fn set_block(
        &self,
        device_id: &DeviceId,
        state: &mut DeviceEnforcement,
        priority: u16,
        tag: &str,
    ) -> Result<(), InstallError> {
        let mac = self.device_mac(device_id).await?;
        let rule = FlowRule {
            cookie: cookie_for(device_id.as_str(), tag),
            priority,
            match_fields: MatchFields::from_mac(mac),
            action: FlowAction::Drop,
        };
        if state.block_rule.as_ref() == Some(&rule) {
            return Ok(());
        }

        self.push_rule(&rule).await?;
        if let Some(previous) = state.block_rule.replace(rule) {
            self.remove_everywhere(&previous).await;
        }
        Ok(())
    }

    async fn clear_block(&self, state: &mut DeviceEnforcement) {
        if let Some(rule) = state.block_rule.take() {
            self.remove_everywhere(&rule).await;
        }
    }

    /// Installe une règle de mitigation ; une règle de surveillance n'est qu'enregistrée
    ///
    /// Renvoie la règle de commutation installée, identique à un appel précédent
    /// pour la même règle.
    pub async fn install_mitigation(&self, rule: &MitigationRule) -> Result<Option<FlowRule>, InstallError> {
        match &rule.device_id {
            Some(device_id) => {
                let _guard = self.cell(device_id).lock_owned().await;
                self.install_mitigation_locked(rule).await
            }
            None => {
                let guard = self.source_cell(rule.source).lock_owned().await;
                let result = self.install_mitigation_locked(rule).await;
                drop(guard);
                // Le verrou d'une source n'est gardé que le temps d'un appel
                self.source_locks
                    .remove_if(&rule.source, |_, lock| Arc::strong_count(lock) == 1);
                result
            }
        }
    }

    async fn install_mitigation_locked(&self, rule: &MitigationRule) -> Result<Option<FlowRule>, InstallError> {
        if let Some(existing) = self.mitigations.get(&rule.id) {
            let (known, flow) = existing.value();
            if known.match_fields == rule.match_fields && known.priority == rule.priority {
                return Ok(flow.clone());
            }
        }

        let action = match rule.kind {
            MitigationKind::Monitor => None,
            MitigationKind::Deny => Some(FlowAction::Drop),
            MitigationKind::Redirect => Some(FlowAction::Forward(self.honeypot_port)),
        };
        let flow = action.map(|action| FlowRule {
            cookie: cookie_for(&rule.id, "mitigation"),
            priority: rule.priority,
            match_fields: rule.match_fields.clone(),
            action,
        });

        if let Some(flow) = &flow {
            self.push_rule(flow).await?;
        }
        self.journal.log_mitigation(rule);
        self.mitigations.insert(rule.id.clone(), (rule.clone(), flow.clone()));
        Ok(flow)
    }

    /// Retire une règle de mitigation, renvoie `false` si elle était inconnue
    pub async fn withdraw_mitigation(&self, rule_id: &str) -> bool {
        match self.mitigations.remove(rule_id) {
            Some((_, (rule, flow))) => {
                if let Some(flow) = flow {
                    self.remove_everywhere(&flow).await;
                }
                info!("Mitigation {} retirée ({})", rule.id, rule.source);
                true
            }
            None => false,
        }
    }

    /// Installe une règle sur tous les commutateurs
    ///
    /// Tout ou rien : si un commutateur refuse la règle, elle est retirée de
    /// ceux qui l'avaient acceptée. L'alerte permanente du refus est conservée.
    async fn push_rule(&self, rule: &FlowRule) -> Result<(), InstallError> {
        let results = join_all(self.switches.iter().map(|switch| async move {
            let result = self.install_with_retry(switch.clone(), rule).await;
            (switch, result)
        }))
        .await;

        let mut accepted = Vec::new();
        let mut first_error = None;
        for (switch, result) in results {
            match result {
                Ok(()) => accepted.push(switch),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => {
                if !accepted.is_empty() {
                    warn!(
                        "Règle {:#x} retirée de {} commutateur(s) après un refus",
                        rule.cookie,
                        accepted.len()
                    );
                }
                for switch in accepted {
                    self.remove_from(switch, rule).await;
                }
                Err(e)
            }
        }
    }

    async fn install_with_retry(&self, switch: Arc<dyn SwitchControl>, rule: &FlowRule) -> Result<(), InstallError> {
        let switch_id = switch.id().to_string();

        let first = self.try_install(&switch, rule).await;
        let result = match first {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Installation refusée sur {}, nouvelle tentative: {}", switch_id, e);
                sleep(self.backoff_with_jitter()).await;
                self.try_install(&switch, rule).await
            }
        };

        let key = (switch_id.clone(), rule.clone());
        match result {
            Ok(()) => {
                self.failures.remove(&key);
                self.journal.log_rule(&switch_id, rule, true);
                Ok(())
            }
            Err(e) => {
                error!("Règle {:#x} non appliquée sur {}: {}", rule.cookie, switch_id, e);
                self.journal.log_enforcement_failure(&switch_id, rule, &e.to_string());
                self.failures.entry(key).or_insert_with(|| EnforcementFailure {
                    switch: switch_id.clone(),
                    rule: rule.clone(),
                    reason: e.to_string(),
                    since: SystemTime::now(),
                });
                Err(e)
            }
        }
    }

    async fn try_install(&self, switch: &Arc<dyn SwitchControl>, rule: &FlowRule) -> Result<(), InstallError> {
        let switch_id = switch.id().to_string();
        match timeout(self.call_timeout, switch.install_rule(rule)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SwitchError::Rejected(reason))) | Ok(Err(SwitchError::Unreachable(reason))) => {
                Err(InstallError::Rejected {
                    switch: switch_id,
                    reason,
                })
            }
            Err(_) => Err(InstallError::Timeout { switch: switch_id }),
        }
    }

    /// Retire une règle partout ; une règle déjà absente n'est pas une erreur
    async fn remove_everywhere(&self, rule: &FlowRule) {
        for switch in &self.switches {
            self.failures.remove(&(switch.id().to_string(), rule.clone()));
            self.remove_from(switch, rule).await;
        }
    }

    async fn remove_from(&self, switch: &Arc<dyn SwitchControl>, rule: &FlowRule) {
        let switch_id = switch.id();
        match timeout(self.call_timeout, switch.remove_rule(rule)).await {
            Ok(Ok(true)) => self.journal.log_rule(switch_id, rule, false),
            Ok(Ok(false)) => debug!("Règle {:#x} déjà absente de {}", rule.cookie, switch_id),
            Ok(Err(e)) => warn!("Suppression de la règle {:#x} sur {} impossible: {}", rule.cookie, switch_id, e),
            Err(_) => warn!("Délai dépassé lors de la suppression sur {}", switch_id),
        }
    }

    fn backoff_with_jitter(&self) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let jitter = if base > 1 { rand::rng().random_range(0..=base / 2) } else { 0 };
        Duration::from_millis(base + jitter)
    }

    async fn device_mac(&self, device_id: &DeviceId) -> Result<MacAddr, InstallError> {
        self.directory
            .mac_of(device_id)
            .await
            .ok_or_else(|| InstallError::UnknownDevice(device_id.clone()))
    }

    fn cell(&self, device_id: &DeviceId) -> Arc<Mutex<DeviceEnforcement>> {
        self.devices
            .entry(device_id.clone())
            .or_default()
            .clone()
    }

    fn source_cell(&self, source: IpAddr) -> Arc<Mutex<()>> {
        self.source_locks.entry(source).or_default().clone()
    }

    pub fn active_redirects(&self) -> Vec<RedirectState> {
        self.redirects.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn redirect_for(&self, device_id: &DeviceId) -> Option<RedirectState> {
        self.redirects.get(device_id).map(|state| state.clone())
    }

    pub fn mitigation_rules(&self) -> Vec<MitigationRule> {
        let mut rules: Vec<MitigationRule> = self.mitigations.iter().map(|entry| entry.value().0.clone()).collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rules
    }

    /// Règle de commutation installée pour une mitigation
    pub fn installed_mitigation(&self, rule_id: &str) -> Option<FlowRule> {
        self.mitigations.get(rule_id).and_then(|entry| entry.value().1.clone())
    }

    /// Alertes permanentes : politiques non appliquées
    pub fn standing_alerts(&self) -> Vec<EnforcementFailure> {
        self.failures.iter().map(|entry| entry.value().clone()).collect()
    }
}
