use crate::error::RuleError;
use crate::models::{priority, BehavioralBaseline, MatchFields};
use serde::{Deserialize, Serialize};

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Nombre maximal de destinations et de ports autorisés par politique générée
const LEAST_PRIVILEGE_ENTRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Règle de politique au niveau équipement
///
/// L'adresse MAC source est ajoutée par le traducteur ; une liste de règles
/// se termine toujours par un refus implicite de priorité minimale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    action: RuleAction,
    match_fields: MatchFields,
    priority: u16,
}

impl PolicyRule {
    pub fn new(action: RuleAction, mut match_fields: MatchFields, priority: u16) -> Result<Self, RuleError> {
        if priority <= priority::DEFAULT_DENY || priority >= priority::QUARANTINE {
            return Err(RuleError::Priority(priority));
        }
        if match_fields.eth_src.is_some() {
            return Err(RuleError::EthSrcReserved);
        }

        if match_fields.tcp_dst.is_some() {
            match match_fields.ip_proto {
                None => match_fields.ip_proto = Some(IPPROTO_TCP),
                Some(IPPROTO_TCP) => {}
                Some(proto) => return Err(RuleError::ProtocolMismatch { proto, layer: "tcp" }),
            }
        }
        if match_fields.udp_dst.is_some() {
            match match_fields.ip_proto {
                None => match_fields.ip_proto = Some(IPPROTO_UDP),
                Some(IPPROTO_UDP) => {}
                Some(proto) => return Err(RuleError::ProtocolMismatch { proto, layer: "udp" }),
            }
        }

        Ok(Self {
            action,
            match_fields,
            priority,
        })
    }

    pub fn allow(match_fields: MatchFields) -> Result<Self, RuleError> {
        Self::new(RuleAction::Allow, match_fields, priority::ALLOW)
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    pub fn match_fields(&self) -> &MatchFields {
        &self.match_fields
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }
}

/// Politique du moindre privilège dérivée du profil de référence
///
/// Autorise les destinations et les ports TCP les plus fréquents ; tout le
/// reste tombe sur le refus implicite.
pub fn least_privilege_rules(baseline: &BehavioralBaseline) -> Vec<PolicyRule> {
    let destinations = baseline
        .common_destinations
        .iter()
        .take(LEAST_PRIVILEGE_ENTRIES)
        .filter_map(|ip| {
            PolicyRule::allow(MatchFields {
                ip_dst: Some(*ip),
                ..Default::default()
            })
            .ok()
        });

    let ports = baseline
        .common_ports
        .iter()
        .take(LEAST_PRIVILEGE_ENTRIES)
        .filter_map(|port| {
            PolicyRule::allow(MatchFields {
                tcp_dst: Some(*port),
                ..Default::default()
            })
            .ok()
        });

    destinations.chain(ports).collect()
}
