use clap::{Parser, Subcommand};

/// Operator commands against a crawl's frontier state on disk.
/// Exit codes: 0=success, 2=invalid arguments, 3=I/O, config or state error
#[derive(Parser, Debug)]
#[command(name = "crawl_frontier")]
#[command(about = "Inspect, seed and recover a persistent crawl frontier")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load seeds into the frontier (fresh, or resumed from its checkpoint).
    Seed {
        #[arg(short, long, default_value = "./data", help = "Directory holding frontier state")]
        data_dir: String,

        #[arg(short, long, help = "Seed file: one URI per line, # comments")]
        seeds: String,

        #[arg(short, long, help = "Frontier configuration (JSON)")]
        config: Option<String>,
    },

    /// Rebuild a fresh frontier from an earlier crawl's recovery journal.
    Recover {
        #[arg(short, long, default_value = "./data", help = "Directory for the rebuilt frontier")]
        data_dir: String,

        #[arg(short, long, help = "Recovery journal of the earlier crawl")]
        journal: String,

        #[arg(long, help = "Treat URIs that finally failed as done")]
        retain_failures: bool,

        #[arg(short, long, help = "Frontier configuration (JSON)")]
        config: Option<String>,
    },

    /// Print queue and URI counts from the last checkpoint.
    Report {
        #[arg(short, long, default_value = "./data", help = "Directory holding frontier state")]
        data_dir: String,

        #[arg(long, help = "Print the counts as JSON")]
        json: bool,

        #[arg(short, long, help = "Frontier configuration (JSON)")]
        config: Option<String>,
    },

    /// Delete every pending URI matching a regular expression.
    Delete {
        #[arg(short, long, default_value = "./data", help = "Directory holding frontier state")]
        data_dir: String,

        #[arg(short, long, help = "Regular expression matched against each URI")]
        pattern: String,

        #[arg(short, long, help = "Frontier configuration (JSON)")]
        config: Option<String>,
    },
}

impl Cli {
    /// On error, clap prints help and exits with code 2 (usage error).
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_command_defaults() {
        let cli = Cli::try_parse_from(["crawl_frontier", "seed", "--seeds", "seeds.txt"]).unwrap();
        match cli.command {
            Commands::Seed {
                data_dir,
                seeds,
                config,
            } => {
                assert_eq!(data_dir, "./data");
                assert_eq!(seeds, "seeds.txt");
                assert!(config.is_none());
            }
            other => panic!("Expected Seed command, got {:?}", other),
        }
    }

    #[test]
    fn test_recover_command() {
        let cli = Cli::try_parse_from([
            "crawl_frontier",
            "recover",
            "--data-dir",
            "/tmp/rebuilt",
            "--journal",
            "/tmp/old/recover.gz",
            "--retain-failures",
        ])
        .unwrap();
        match cli.command {
            Commands::Recover {
                data_dir,
                journal,
                retain_failures,
                ..
            } => {
                assert_eq!(data_dir, "/tmp/rebuilt");
                assert_eq!(journal, "/tmp/old/recover.gz");
                assert!(retain_failures);
            }
            other => panic!("Expected Recover command, got {:?}", other),
        }
    }

    #[test]
    fn test_recover_requires_journal() {
        assert!(Cli::try_parse_from(["crawl_frontier", "recover"]).is_err());
    }

    #[test]
    fn test_delete_and_report() {
        let cli = Cli::try_parse_from(["crawl_frontier", "delete", "-p", "\\.pdf$"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { ref pattern, .. } if pattern == "\\.pdf$"));

        let cli = Cli::try_parse_from(["crawl_frontier", "report", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Report { json: true, .. }));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["crawl_frontier", "crawl"]).is_err());
    }
}
