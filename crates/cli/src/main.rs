use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ferry_api::{FerryApi, InProcApi};
use ferry_apply::{ExecOptions, Registry};
use ferry_core::{Deployable, DeploymentPlan, DeploymentTarget, Event};
use ferry_planner::{Planner, PlannerOptions};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ferryctl", version, about = "Plan and deploy deployables")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Override the target namespace from the input file
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the operations a deployables file compiles to
    Plan { file: PathBuf },
    /// Print every object the plan would apply, as YAML
    Render { file: PathBuf },
    /// Print the order operations would execute in
    Order { file: PathBuf },
    /// Execute the plan against the current kube context
    Deploy { file: PathBuf },
}

/// Input file: one target and the deployables to land there.
#[derive(Debug, Deserialize)]
struct Input {
    target: DeploymentTarget,
    #[serde(default)]
    deployables: Vec<Deployable>,
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

fn load(file: &PathBuf, ns: Option<&str>) -> Result<Input> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut input: Input = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    if let Some(ns) = ns {
        input.target.namespace = ns.to_string();
    }
    Ok(input)
}

fn plan_offline(input: &Input) -> Result<DeploymentPlan> {
    Ok(Planner::new(PlannerOptions::from_env()).plan_deployment(&input.target, &input.deployables)?)
}

fn print_event(ev: &Event) {
    let ready = match ev.ready {
        ferry_core::Ready::Ready => "ready",
        ferry_core::Ready::NotReady => "not ready",
        ferry_core::Ready::Unknown => "unknown",
    };
    let mut line = format!("{:?} • {} • {} • {}", ev.stage, ev.category, ev.resource_id, ready);
    if !ev.wait_details.is_empty() {
        line.push_str(&format!(" ({})", ev.wait_details));
    }
    println!("{}", line);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { file } => {
            let plan = plan_offline(&load(&file, cli.namespace.as_deref())?)?;
            match cli.output {
                Output::Human => {
                    for op in &plan.operations {
                        println!("{} • {}", op.kind, op.description);
                    }
                    for hint in &plan.hints {
                        println!("hint: {}", hint);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Render { file } => {
            let plan = plan_offline(&load(&file, cli.namespace.as_deref())?)?;
            print!("{}", plan.declarations_yaml()?);
        }
        Commands::Order { file } => {
            let plan = plan_offline(&load(&file, cli.namespace.as_deref())?)?;
            let options = ExecOptions::from_env();
            let compiled = ferry_api::compile(&Registry::with_defaults(), &options.order_rules, plan)?;
            match cli.output {
                Output::Human => {
                    for (n, &i) in compiled.sorted.iter().enumerate() {
                        let op = &compiled.plan.operations[i];
                        let after: Vec<_> = compiled.orders[i].sched_after_category.iter().map(String::as_str).collect();
                        println!("{:>3}. {} (after: {})", n + 1, op.description, after.join(", "));
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = compiled
                        .sorted
                        .iter()
                        .map(|&i| serde_json::json!({"description": compiled.plan.operations[i].description, "order": compiled.orders[i]}))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Deploy { file } => {
            let input = load(&file, cli.namespace.as_deref())?;
            let api = InProcApi::connect().await?;
            let plan = api.plan(&input.target, &input.deployables)?;
            info!(namespace = %plan.namespace_reference, ops = plan.operations.len(), "deploy invoked");
            let mut handle = api.execute(plan).await?;
            loop {
                tokio::select! {
                    maybe = handle.rx.recv() => match maybe {
                        Some(ev) => match cli.output {
                            Output::Human => print_event(&ev),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        warn!("Ctrl-C received; cancelling deployment");
                        handle.cancel.cancel();
                    }
                }
            }
            let summary = handle.join().await?;
            info!(ops = summary.operations, waited = summary.waiters, "deploy finished");
        }
    }
    Ok(())
}
