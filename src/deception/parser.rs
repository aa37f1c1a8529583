//! Lecture des événements de l'environnement leurre (format Cowrie)

use crate::error::ParseError;
use crate::models::Severity;
use chrono::DateTime;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::SystemTime;

/// Préfixes reconnus pour une commande dans une ligne texte
const COMMAND_MARKERS: [&str; 3] = ["command", "executed", "cmd"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeceptionEventKind {
    LoginFailed,
    LoginSuccess,
    Command,
    FileTransfer,
    ClientVersion,
    SessionConnect,
    Other(String),
}

impl DeceptionEventKind {
    fn from_event_id(event_id: &str) -> Self {
        match event_id {
            "cowrie.login.failed" => DeceptionEventKind::LoginFailed,
            "cowrie.login.success" => DeceptionEventKind::LoginSuccess,
            "cowrie.command.input" => DeceptionEventKind::Command,
            "cowrie.session.file_download" | "cowrie.session.file_upload" => DeceptionEventKind::FileTransfer,
            "cowrie.client.version" => DeceptionEventKind::ClientVersion,
            "cowrie.session.connect" => DeceptionEventKind::SessionConnect,
            other => DeceptionEventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeceptionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeceptionEventKind::LoginFailed => f.write_str("login_failed"),
            DeceptionEventKind::LoginSuccess => f.write_str("login_success"),
            DeceptionEventKind::Command => f.write_str("command"),
            DeceptionEventKind::FileTransfer => f.write_str("file_transfer"),
            DeceptionEventKind::ClientVersion => f.write_str("client_version"),
            DeceptionEventKind::SessionConnect => f.write_str("session_connect"),
            DeceptionEventKind::Other(id) => write!(f, "other({})", id),
        }
    }
}

/// Événement capturé par l'environnement leurre
#[derive(Debug, Clone)]
pub struct DeceptionEvent {
    pub source: IpAddr,
    pub kind: DeceptionEventKind,
    pub command: Option<String>,
    pub username: Option<String>,
    pub url: Option<String>,
    pub client_version: Option<String>,
    pub timestamp: SystemTime,
}

impl DeceptionEvent {
    /// Résumé lisible pour le journal
    pub fn describe(&self) -> String {
        match (&self.kind, &self.command, &self.username, &self.url) {
            (DeceptionEventKind::Command, Some(command), _, _) => format!("commande: {}", command),
            (DeceptionEventKind::LoginSuccess, _, Some(user), _) => format!("connexion réussie: {}", user),
            (DeceptionEventKind::LoginFailed, _, Some(user), _) => format!("tentative de connexion: {}", user),
            (DeceptionEventKind::FileTransfer, _, _, Some(url)) => format!("transfert de fichier: {}", url),
            (kind, _, _, _) => format!("événement {}", kind),
        }
    }
}

#[derive(Deserialize)]
struct CowrieLine {
    #[serde(default)]
    eventid: String,
    #[serde(default)]
    src_ip: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Analyse une ligne du journal, JSON ou texte libre
pub fn parse_line(line: &str) -> Result<DeceptionEvent, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line.starts_with('{') {
        parse_json(line)
    } else {
        parse_text(line)
    }
}

fn parse_json(line: &str) -> Result<DeceptionEvent, ParseError> {
    let raw: CowrieLine = serde_json::from_str(line)?;
    let source = raw
        .src_ip
        .as_deref()
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        .ok_or_else(|| ParseError::MissingSource(raw.src_ip.clone().unwrap_or_default()))?;

    // Horodatage absent ou illisible : heure de lecture
    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(SystemTime::from)
        .unwrap_or_else(SystemTime::now);

    Ok(DeceptionEvent {
        source,
        kind: DeceptionEventKind::from_event_id(&raw.eventid),
        command: raw.input.filter(|input| !input.trim().is_empty()),
        username: raw.username,
        url: raw.url,
        client_version: raw.version,
        timestamp,
    })
}

fn parse_text(line: &str) -> Result<DeceptionEvent, ParseError> {
    let source = first_ipv4(line).ok_or_else(|| ParseError::MissingSource(line.chars().take(80).collect()))?;
    let command = extract_command(line);
    let kind = if command.is_some() {
        DeceptionEventKind::Command
    } else {
        DeceptionEventKind::Other("unknown".to_string())
    };

    Ok(DeceptionEvent {
        source: IpAddr::V4(source),
        kind,
        command,
        username: None,
        url: None,
        client_version: None,
        timestamp: SystemTime::now(),
    })
}

fn first_ipv4(line: &str) -> Option<Ipv4Addr> {
    line.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|token| token.trim_matches('.'))
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

fn extract_command(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    COMMAND_MARKERS.iter().find_map(|marker| {
        let start = lower.find(marker)? + marker.len();
        let rest = &line[start..];
        let payload = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        // Le mot-clé doit être suivi d'un séparateur
        if payload.len() == rest.len() {
            return None;
        }
        let payload = payload.trim();
        (!payload.is_empty()).then(|| payload.to_string())
    })
}

/// Sévérité d'un événement
///
/// Les commandes destructrices sont reconnues sur des mots entiers, chemin
/// d'exécutable compris (`/bin/rm`).
pub fn classify(event: &DeceptionEvent, destructive: &[String]) -> Severity {
    match event.kind {
        DeceptionEventKind::LoginSuccess | DeceptionEventKind::FileTransfer => Severity::High,
        DeceptionEventKind::Command => match &event.command {
            Some(command) if is_destructive(command, destructive) => Severity::High,
            _ => Severity::Medium,
        },
        _ => Severity::Low,
    }
}

fn is_destructive(command: &str, destructive: &[String]) -> bool {
    command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '|' | '&' | '(' | ')' | '`'))
        .filter(|token| !token.is_empty())
        .map(|token| token.rsplit('/').next().unwrap_or(token).to_ascii_lowercase())
        .any(|word| destructive.iter().any(|verb| verb.eq_ignore_ascii_case(&word)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verbs() -> Vec<String> {
        ["rm", "dd", "mkfs", "shutdown", "reboot", "format", "delete"]
            .iter()
            .map(|v| v.to_string())
            .collect()
    }

    #[test]
    fn test_parse_cowrie_json() {
        let line = r#"{"eventid":"cowrie.login.success","src_ip":"192.0.2.10","username":"root","password":"admin","timestamp":"2024-03-01T10:00:00.123456Z"}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.kind, DeceptionEventKind::LoginSuccess);
        assert_eq!(event.source, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(event.username.as_deref(), Some("root"));
        assert_eq!(classify(&event, &verbs()), Severity::High);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(matches!(parse_line("   "), Err(ParseError::Empty)));
        assert!(matches!(parse_line("{not json"), Err(ParseError::Json(_))));
        assert!(matches!(
            parse_line(r#"{"eventid":"cowrie.command.input","input":"ls"}"#),
            Err(ParseError::MissingSource(_))
        ));
        assert!(matches!(parse_line("session closed"), Err(ParseError::MissingSource(_))));
    }

    #[test]
    fn test_parse_text_fallback() {
        let event = parse_line("2024-03-01 [SSHChannel] 198.51.100.4 CMD: cat /etc/passwd").unwrap();
        assert_eq!(event.source, "198.51.100.4".parse::<IpAddr>().unwrap());
        assert_eq!(event.kind, DeceptionEventKind::Command);
        assert_eq!(event.command.as_deref(), Some("cat /etc/passwd"));
        assert_eq!(classify(&event, &verbs()), Severity::Medium);

        let event = parse_line("New connection: 198.51.100.4:51234").unwrap();
        assert_eq!(event.kind, DeceptionEventKind::Other("unknown".to_string()));
        assert_eq!(classify(&event, &verbs()), Severity::Low);
    }

    #[test]
    fn test_destructive_commands_match_whole_words() {
        let command = |input: &str| DeceptionEvent {
            source: "192.0.2.1".parse().unwrap(),
            kind: DeceptionEventKind::Command,
            command: Some(input.to_string()),
            username: None,
            url: None,
            client_version: None,
            timestamp: SystemTime::now(),
        };
        assert_eq!(classify(&command("/bin/rm -rf /"), &verbs()), Severity::High);
        assert_eq!(classify(&command("cd /tmp; dd if=/dev/zero of=/dev/sda"), &verbs()), Severity::High);
        assert_eq!(classify(&command("cat information.txt"), &verbs()), Severity::Medium);
        assert_eq!(classify(&command("uname -a"), &verbs()), Severity::Medium);
    }
}
