use clap::{Parser, Subcommand};
use keyrack_core::{
    CONFIG_ENV, Config, CredentialView, Dispatcher, DryRunHandler, ProbeOutcome, ProbeReport,
    Registry, SystemClock,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "keyrack",
    about = "keyrack: priority-ordered API credentials with daily quotas and liveness probes",
    version,
    after_help = "Examples:\n  keyrack list\n  keyrack select openai\n  keyrack acquire gemini --count 3\n  keyrack probe --service openai\n  keyrack route list my tilda projects"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML). Defaults to $KEYRACK_CONFIG, then to *_API_KEY env vars.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered credentials (secrets masked)
    #[command(alias = "ls")]
    List {
        /// Only this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Show which credential a lookup would pick, without recording usage
    Select {
        service: String,
    },

    /// Pick a credential and record usage against its quota
    Acquire {
        service: String,

        /// Number of acquisitions to perform
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Detailed quota and liveness state for one service
    Info {
        service: String,
    },

    /// Availability summary for every service
    Services,

    /// Check credentials against their vendor endpoints
    Probe {
        /// Only this service
        #[arg(long)]
        service: Option<String>,

        /// Per-probe timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Route a free-text command and show the credential it would use
    Route {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

/// Outcome of a command that ran without error.
enum Outcome {
    Done,
    /// Lookup found no usable credential.
    Unavailable,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "info,keyrack_core=debug"
    } else {
        "warn,keyrack_core=info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = load(cli.config.clone()).and_then(|(config, registry)| match &cli.command {
        Commands::List { service } => cmd_list(&registry, service.as_deref(), cli.json),
        Commands::Select { service } => cmd_select(&registry, service, false, 1, cli.json),
        Commands::Acquire { service, count } => {
            cmd_select(&registry, service, true, *count, cli.json)
        }
        Commands::Info { service } => cmd_info(&registry, service, cli.json),
        Commands::Services => cmd_services(&registry, cli.json),
        Commands::Probe { service, timeout } => {
            cmd_probe(config, &registry, service.as_deref(), *timeout, cli.json)
        }
        Commands::Route { command } => cmd_route(&config, &registry, &command.join(" ")),
    });

    match result {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Unavailable) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            if let keyrack_core::Error::NoCredentialsLoaded = e {
                eprintln!("\n  Get started:");
                eprintln!("    export OPENAI_API_KEY=sk-...");
                eprintln!("    keyrack --config keyrack.toml list");
            }
            ExitCode::FAILURE
        }
    }
}

fn load(path: Option<PathBuf>) -> keyrack_core::Result<(Config, Registry)> {
    let path = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let config = match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config file");
            Config::load(&path)?
        }
        None => {
            tracing::debug!("no config file; reading credentials from environment");
            Config::from_env()
        }
    };
    let registry = config.build_registry(Arc::new(SystemClock))?;
    Ok((config, registry))
}

fn runtime() -> keyrack_core::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| keyrack_core::Error::Runtime(format!("Failed to start async runtime: {}", e)))
}

fn print_json(value: &impl serde::Serialize) -> keyrack_core::Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| keyrack_core::Error::Runtime(format!("Failed to serialize output: {}", e)))?;
    println!("{}", out);
    Ok(())
}

fn cmd_list(registry: &Registry, service: Option<&str>, json: bool) -> keyrack_core::Result<Outcome> {
    let entries: Vec<CredentialView> = match service {
        Some(s) => registry.credentials_for(s),
        None => registry.all(),
    };

    if json {
        print_json(&entries)?;
        return Ok(Outcome::Done);
    }

    if entries.is_empty() {
        eprintln!("No credentials registered for {}.", service.unwrap_or("any service"));
        return Ok(Outcome::Done);
    }

    println!(
        "  {:<14} {:<24} {:>4} {:<12} {:<8} Secret",
        "Service", "Name", "Prio", "Usage", "Status"
    );
    println!("  {}", "-".repeat(78));
    for entry in &entries {
        println!(
            "  {:<14} {:<24} {:>4} {:<12} {:<8} {}",
            entry.service,
            entry.name,
            entry.priority,
            format_usage(entry.usage_count, entry.quota_limit),
            if entry.is_working { "ok" } else { "failed" },
            entry.masked_secret
        );
    }
    println!("\n  {} credential(s) registered", entries.len());

    Ok(Outcome::Done)
}

fn format_usage(used: u32, limit: Option<u32>) -> String {
    match limit {
        Some(limit) => format!("{}/{}", used, limit),
        None => format!("{}/-", used),
    }
}

fn cmd_select(
    registry: &Registry,
    service: &str,
    acquire: bool,
    count: u32,
    json: bool,
) -> keyrack_core::Result<Outcome> {
    let mut picks = Vec::new();
    for _ in 0..count.max(1) {
        let selection = if acquire {
            registry.acquire(service)
        } else {
            registry.select(service)
        };
        match selection {
            Some(s) => picks.push(s.summary()),
            None => break,
        }
    }

    let exhausted = picks.len() < count.max(1) as usize;

    if json {
        print_json(&serde_json::json!({
            "service": service,
            "success": !picks.is_empty(),
            "selections": picks,
            "error": exhausted.then(|| format!("no credential available for service {}", service)),
        }))?;
    } else {
        for pick in &picks {
            println!(
                "  {}  {} (priority {})  {}",
                pick.service, pick.name, pick.priority, pick.masked_secret
            );
        }
        if exhausted {
            eprintln!("No credential available for service {}.", service);
        }
    }

    Ok(if picks.is_empty() {
        Outcome::Unavailable
    } else {
        Outcome::Done
    })
}

fn cmd_info(registry: &Registry, service: &str, json: bool) -> keyrack_core::Result<Outcome> {
    let info = registry.service_info(service);

    if json {
        print_json(&info)?;
        return Ok(Outcome::Done);
    }

    println!(
        "\n  {}: {}/{} working, current: {}",
        info.service,
        info.available_keys,
        info.total_keys,
        info.current_key.as_deref().unwrap_or("none")
    );
    println!("  {}", "-".repeat(60));
    for key in &info.keys {
        println!(
            "  {} {:<24} prio {:>3}  usage {:<10} {}",
            if key.is_current { "*" } else { " " },
            key.name,
            key.priority,
            format_usage(key.quota.used, key.quota.limit),
            if key.working { "ok" } else { "failed" }
        );
    }
    println!();
    Ok(Outcome::Done)
}

fn cmd_services(registry: &Registry, json: bool) -> keyrack_core::Result<Outcome> {
    let overview = registry.overview();

    if json {
        print_json(&overview)?;
        return Ok(Outcome::Done);
    }

    println!("  {:<16} {:<10} {:<8} Current", "Service", "Available", "Working");
    println!("  {}", "-".repeat(60));
    for (service, summary) in &overview.services {
        println!(
            "  {:<16} {:<10} {:<8} {}",
            service,
            if summary.available { "yes" } else { "no" },
            format!("{}/{}", summary.working_keys, summary.total_keys),
            summary.current_key.as_deref().unwrap_or("-")
        );
    }
    Ok(Outcome::Done)
}

fn cmd_probe(
    mut config: Config,
    registry: &Registry,
    service: Option<&str>,
    timeout: Option<u64>,
    json: bool,
) -> keyrack_core::Result<Outcome> {
    if let Some(secs) = timeout {
        config.settings.probe_timeout_secs = secs.max(1);
    }
    let prober = config.settings.prober()?;
    let rt = runtime()?;

    let report = rt.block_on(async {
        match service {
            Some(s) => prober.probe_service(registry, s).await,
            None => prober.probe_all(registry).await,
        }
    });

    if json {
        print_json(&report)?;
    } else {
        print_probe_report(&report);
    }
    Ok(Outcome::Done)
}

fn print_probe_report(report: &ProbeReport) {
    if report.summary.total == 0 {
        eprintln!("No credentials to probe.");
        return;
    }

    for (service, results) in &report.services {
        let working = results.iter().filter(|r| r.working).count();
        println!("\n  {}: {}/{} working", service, working, results.len());
        for r in results {
            let detail = match &r.outcome {
                ProbeOutcome::Accepted => "accepted".to_string(),
                ProbeOutcome::Rejected { status } => format!("rejected (HTTP {})", status),
                ProbeOutcome::Error { message } => format!("error: {}", message),
                ProbeOutcome::TimedOut => "timed out".to_string(),
                ProbeOutcome::Unprobed => "no probe".to_string(),
            };
            println!(
                "    {} {:<24} prio {:>3}  {}",
                if r.working { "ok " } else { "ERR" },
                r.name,
                r.priority,
                detail
            );
        }
    }

    println!(
        "\n  Total {}  working {}  failed {}\n",
        report.summary.total, report.summary.working, report.summary.failed
    );
}

fn cmd_route(config: &Config, registry: &Registry, command: &str) -> keyrack_core::Result<Outcome> {
    let dispatcher = Dispatcher::new(registry, DryRunHandler, &config.settings.fallback_service);
    let rt = runtime()?;
    let response = rt.block_on(dispatcher.dispatch(command));

    // Always JSON: this mirrors what an HTTP front end would return
    print_json(&response)?;

    Ok(if response.success {
        Outcome::Done
    } else {
        Outcome::Unavailable
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usage() {
        assert_eq!(format_usage(3, Some(10)), "3/10");
        assert_eq!(format_usage(7, None), "7/-");
    }

    #[test]
    fn test_parse_route_trailing_words() {
        let cli = Cli::try_parse_from(["keyrack", "route", "list", "my", "tilda", "projects"]).unwrap();
        match cli.command {
            Commands::Route { command } => assert_eq!(command.join(" "), "list my tilda projects"),
            _ => panic!("expected route"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["keyrack", "acquire", "openai", "--count", "3", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Acquire { service, count } => {
                assert_eq!(service, "openai");
                assert_eq!(count, 3);
            }
            _ => panic!("expected acquire"),
        }
    }

    #[test]
    fn test_route_requires_command() {
        assert!(Cli::try_parse_from(["keyrack", "route"]).is_err());
    }
}
