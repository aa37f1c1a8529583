use crate::models::ThreatLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Interface en ligne de commande de ZSentinel
#[derive(Parser, Debug)]
#[command(name = "zsentinel")]
#[command(about = "Contrôle d'accès réseau adaptatif pour équipements IoT")]
#[command(version)]
pub struct Cli {
    /// Fichier de configuration (par défaut /etc/zsentinel/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Démarre la boucle de contrôle jusqu'à Ctrl+C
    Start {
        /// Alimente les commutateurs en mémoire avec du trafic synthétique
        #[arg(long)]
        simulate: bool,
    },

    /// Vérifie la configuration et quitte
    CheckConfig,

    /// Affiche la décision pour un score et un niveau de menace
    Decide {
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        trust: u8,

        /// none, low, medium, high ou critical
        #[arg(long, default_value = "none")]
        threat: ThreatLevel,
    },

    /// Affiche l'historique persisté du score d'un équipement
    History {
        #[arg(short, long)]
        device: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decide() {
        let cli = Cli::try_parse_from(["zsentinel", "decide", "--trust", "30", "--threat", "HIGH"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Decide {
                trust: 30,
                threat: ThreatLevel::High
            }
        );
        assert!(Cli::try_parse_from(["zsentinel", "decide", "--trust", "101"]).is_err());
    }

    #[test]
    fn test_parse_start_with_config() {
        let cli = Cli::try_parse_from(["zsentinel", "start", "--simulate", "-c", "/tmp/z.json"]).unwrap();
        assert_eq!(cli.command, Command::Start { simulate: true });
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/z.json")));
    }
}
