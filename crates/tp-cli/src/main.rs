use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tp_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tproxy")]
#[command(version, about = "Transparent proxy traffic interception", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the redirection rules or eBPF programs
    Setup(Options),
    /// Remove everything installed by setup
    Cleanup(Options),
    /// Print the rules setup would apply, without applying them
    Render(Options),
}

#[derive(Args, Clone)]
struct Options {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long)]
    verbose: bool,
    /// Use the eBPF backend instead of iptables
    #[arg(long)]
    ebpf: bool,
    /// Redirect DNS traffic to the DNS proxy port
    #[arg(long)]
    redirect_dns: bool,
    #[arg(long)]
    owner_uid: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct Report<'a> {
    operation: &'a str,
    dry_run: bool,
    ebpf: bool,
    output: &'a str,
}

impl Options {
    fn load(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        cfg.dry_run |= self.dry_run;
        cfg.verbose |= self.verbose;
        cfg.ebpf.enabled |= self.ebpf;
        cfg.redirect.dns.enabled |= self.redirect_dns;
        if let Some(uid) = &self.owner_uid {
            cfg.owner.uid = uid.clone();
        }

        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (operation, mut options) = match cli.command {
        Commands::Setup(options) => ("setup", options),
        Commands::Cleanup(options) => ("cleanup", options),
        Commands::Render(options) => ("render", options),
    };
    if operation == "render" {
        options.dry_run = true;
    }

    init_tracing(options.verbose);

    let cfg = options.load()?;
    tracing::debug!("running {} (dry-run: {}, ebpf: {})", operation, cfg.dry_run, cfg.ebpf.enabled);
    let output = tokio::runtime::Runtime::new()?.block_on(async {
        match operation {
            "cleanup" => tproxy::cleanup(&cfg).await,
            _ => tproxy::setup(&cfg).await,
        }
    })?;

    match options.output {
        OutputFormat::Text => {
            if !output.is_empty() {
                println!("{}", output.trim_end());
            }
        }
        OutputFormat::Json => {
            let report = Report {
                operation,
                dry_run: cfg.dry_run,
                ebpf: cfg.ebpf.enabled,
                output: &output,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tproxy.yaml");
        std::fs::write(&path, "owner:\n  uid: \"1337\"\nverbose: true\n").expect("write config");

        let cli = Cli::try_parse_from([
            "tproxy",
            "setup",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--dry-run",
            "--redirect-dns",
            "--output",
            "json",
        ])
        .expect("valid arguments");

        let Commands::Setup(options) = cli.command else {
            panic!("expected setup");
        };
        assert!(options.output == OutputFormat::Json);

        let cfg = options.load().expect("config loads");
        assert_eq!(cfg.owner.uid, "1337");
        assert!(cfg.verbose);
        assert!(cfg.dry_run);
        assert!(cfg.redirect.dns.enabled);
        assert!(!cfg.ebpf.enabled);
    }

    #[test]
    fn test_owner_flag() {
        let cli = Cli::try_parse_from(["tproxy", "cleanup", "--owner-uid", "proxy", "--ebpf"])
            .expect("valid arguments");
        let Commands::Cleanup(options) = cli.command else {
            panic!("expected cleanup");
        };

        let cfg = options.load().expect("defaults");
        assert_eq!(cfg.owner.uid, "proxy");
        assert!(cfg.ebpf.enabled);
    }
}
