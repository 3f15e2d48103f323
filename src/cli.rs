//! CLI argument parsing for the txtimer demo binary

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the final report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Paged text report (default)
    Text,
    /// JSON snapshot for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "txtimer")]
#[command(version)]
#[command(about = "Drive synthetic transactions through txtimer and print the report", long_about = None)]
pub struct Cli {
    /// Number of worker threads generating transactions
    #[arg(short = 't', long = "threads", default_value = "4")]
    pub threads: usize,

    /// Number of distinct transaction names per group
    #[arg(short = 'n', long = "transactions", default_value = "5")]
    pub transactions: usize,

    /// How long to generate load, in seconds
    #[arg(short = 's', long = "seconds", default_value = "3")]
    pub seconds: u64,

    /// Upper bound of the simulated latency per transaction (ms)
    #[arg(long = "max-latency-ms", value_name = "MS", default_value = "25")]
    pub max_latency_ms: u64,

    /// Probability that a transaction exits with a non-zero result code
    #[arg(long = "failure-rate", value_name = "P", default_value = "0.05")]
    pub failure_rate: f64,

    /// Load configuration from a TOML file instead of TXTIMER_* variables
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Reject argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("--threads must be >= 1".to_string());
        }
        if self.transactions == 0 {
            return Err("--transactions must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(format!(
                "--failure-rate must be in [0, 1], got {}",
                self.failure_rate
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["txtimer"]);
        assert_eq!(cli.threads, 4);
        assert_eq!(cli.transactions, 5);
        assert_eq!(cli.seconds, 3);
        assert_eq!(cli.format, OutputFormat::Text);
        assert!(cli.config.is_none());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_json_format_and_config() {
        let cli = Cli::parse_from(["txtimer", "--format", "json", "-c", "timer.toml", "-t", "2"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("timer.toml")));
        assert_eq!(cli.threads, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cli = Cli::parse_from(["txtimer", "--threads", "0"]);
        assert!(cli.validate().is_err());
        let cli = Cli::parse_from(["txtimer", "--failure-rate", "1.5"]);
        assert!(cli.validate().unwrap_err().contains("failure-rate"));
    }
}
