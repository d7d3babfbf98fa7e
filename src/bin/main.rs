// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! CLI tool for Privilege Gate (pgate)

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pgatelib::{
    AccessAgent, AgentConfig, CollectionReport, ConsentRequest, MonitorKind, MonitorRequest,
    NativeHost, PerformanceOptions, RiskLevel,
};

#[derive(Parser)]
#[command(name = "pgate")]
#[command(about = "Privilege Gate: consent-gated access to host monitoring and inventory", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show elevation status and enabled privileges
    Privileges,
    /// Ask the consent gate whether an operation may proceed
    Consent {
        /// Operation name recorded in the audit log
        #[arg(short, long)]
        operation: String,
        /// Risk level: low, medium, high or critical
        #[arg(short, long, default_value = "medium")]
        risk: String,
        /// Why the operation is needed
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Collect a best-effort inventory snapshot
    Inventory {
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Take a performance sample
    Perf {
        /// Skip the process section
        #[arg(long)]
        no_processes: bool,
        /// Number of processes to report
        #[arg(short, long)]
        top: Option<usize>,
    },
    /// Start a monitor and hold it until Ctrl+C or expiry
    Monitor {
        /// registry, cert, trace or log
        #[arg(short, long)]
        kind: String,
        /// Session id
        #[arg(short, long)]
        id: String,
        /// Target descriptor, e.g. HKCU\Software\Test or Security|*[System[EventID=4624]]
        #[arg(short, long)]
        target: String,
        /// Maximum duration in seconds
        #[arg(short, long)]
        max_duration: Option<u64>,
        /// Ask for consent even if the target does not need elevation
        #[arg(long)]
        require_elevation: bool,
    },
    /// Dispatch one JSON request ("-" reads stdin)
    Request { json: String },
    /// Print a sample configuration file
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AgentConfig::from_toml_file(path)?,
        None => AgentConfig::default(),
    };

    env_logger::Builder::new()
        .filter_level(config.log_level.into())
        .parse_default_env()
        .init();

    if let Commands::Config = cli.command {
        print!("{}", AgentConfig::sample_toml());
        return Ok(());
    }

    let agent = AccessAgent::new(config, Arc::new(NativeHost::new()));
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Privileges => {
            let snap = agent.check_privileges();
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                println!("{}", "═══ Privileges ═══".cyan().bold());
                println!("  {} {}", "Principal:".white().bold(), snap.principal());
                println!("  {} {}", "Administrator:".white().bold(), yes_no(snap.is_administrator));
                println!("  {} {}", "Elevated:".white().bold(), yes_no(snap.is_elevated));
                if !snap.enabled_privileges.is_empty() {
                    println!("  {}", "Enabled privileges:".white().bold());
                    for p in &snap.enabled_privileges {
                        println!("    {}", p);
                    }
                }
                if let Some(err) = &snap.error {
                    println!("  {} {}", "Probe error:".red().bold(), err);
                }
            }
        }
        Commands::Consent {
            operation,
            risk,
            reason,
            correlation_id,
        } => {
            let risk: RiskLevel = risk.parse()?;
            let mut request = ConsentRequest::new(operation, risk, reason);
            if let Some(id) = correlation_id {
                request = request.with_correlation_id(id);
            }
            let decision = agent.request_elevation_consent(&request);
            if json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                let verdict = if decision.granted {
                    "GRANTED".green().bold()
                } else {
                    "DENIED".red().bold()
                };
                println!("{} ({}) - {}", verdict, decision.user_response, decision.reason);
            }
        }
        Commands::Inventory { correlation_id } => {
            let report = agent.get_inventory(correlation_id);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report("Inventory", &report);
            }
        }
        Commands::Perf { no_processes, top } => {
            let report = agent.get_performance_sample(PerformanceOptions {
                correlation_id: None,
                include_processes: !no_processes,
                top_processes: top,
            });
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report("Performance", &report);
            }
        }
        Commands::Monitor {
            kind,
            id,
            target,
            max_duration,
            require_elevation,
        } => {
            let kind: MonitorKind = kind.parse()?;
            let mut request = MonitorRequest::new(kind, id.clone(), target);
            request.max_duration = max_duration.map(Duration::from_secs);
            if require_elevation {
                request = request.requires_elevation(true);
            }

            let started = agent.start_monitor(request)?;
            eprintln!(
                "{} {} session '{}' (Ctrl+C to stop)",
                "▶".green(),
                kind,
                started.session_id
            );

            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                r.store(false, Ordering::SeqCst);
            })?;

            while running.load(Ordering::SeqCst) && agent.is_monitor_active(kind, &id) {
                std::thread::sleep(Duration::from_millis(250));
            }

            match agent.stop_monitor(kind, &id) {
                Ok(stopped) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&stopped)?);
                    } else {
                        println!(
                            "Stopped '{}' after {:.1}s",
                            stopped.session_id,
                            stopped.ran_for_ms as f64 / 1000.0
                        );
                    }
                }
                // Already swept after reaching its maximum duration
                Err(_) => eprintln!("Session '{}' expired", id),
            }
        }
        Commands::Request { json: body } => {
            let body = if body == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                body
            };
            println!("{}", agent.handle_json(&body));
        }
        Commands::Config => {}
    }

    agent.shutdown();
    Ok(())
}

fn yes_no(value: bool) -> colored::ColoredString {
    if value {
        "yes".green()
    } else {
        "no".yellow()
    }
}

fn print_report<T: serde::Serialize>(title: &str, report: &CollectionReport<T>) {
    println!("{}", format!("═══ {} ═══", title).cyan().bold());
    println!(
        "  {} {}  {} {}",
        "Device:".white().bold(),
        report.device_id,
        "Correlation:".white().bold(),
        report.correlation_id
    );
    if !report.success {
        println!(
            "  {} {}",
            "Failed:".red().bold(),
            report.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }

    let mut names: Vec<_> = report.sections.keys().copied().collect();
    names.sort();
    for name in names {
        match report.sections.get(&name).and_then(|s| s.as_ref()) {
            Some(section) => {
                println!("  {} {}", "✓".green(), name.label().white().bold());
                if let Ok(body) = serde_json::to_string(section) {
                    println!("    {}", body);
                }
            }
            None => println!("  {} {}", "✗".red(), name.label().white().bold()),
        }
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow().bold(), warning);
    }
}
