use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tether_core::config::Settings;
use tether_core::{ReconcileSubject, TYPE_READY};
use tether_kubehub::{EndpointResolver, KubeResolver};
use tether_reconcile::Reconciler;
use tether_registry::CacheRegistry;
use tracing::{error, info};

mod run;

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Reconcile manifests against remote Kubernetes endpoints")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Upper bound for the initial sync of a watch (seconds)
    #[arg(long = "sync-timeout-secs", global = true, env = "TETHER_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,

    /// Namespace for namespaced manifests that leave it empty
    #[arg(long = "default-ns", global = true, env = "TETHER_DEFAULT_NAMESPACE")]
    default_namespace: Option<String>,

    /// Field manager used for server-side apply
    #[arg(long = "field-owner", global = true, env = "TETHER_FIELD_OWNER")]
    field_owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every subject in a file until interrupted
    Run {
        /// YAML file with one subject per document
        #[arg(long = "subjects")]
        subjects: PathBuf,
        /// Resync period (seconds)
        #[arg(long = "poll-secs", env = "TETHER_POLL_SECS")]
        poll_secs: Option<u64>,
        /// Reconcile each subject once and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
    /// Run one observe step for a subject and print the diff
    Observe {
        #[arg(long = "subject")]
        subject: PathBuf,
    },
    /// Evaluate a readiness expression against a YAML or JSON document
    Eval {
        #[arg(long = "expr")]
        expr: String,
        #[arg(long = "doc")]
        doc: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut s = Settings::from_env();
        if let Some(secs) = self.sync_timeout_secs {
            s.sync_timeout = Duration::from_secs(secs);
        }
        if let Some(ns) = self.default_namespace.as_deref().filter(|n| !n.is_empty()) {
            s.default_namespace = ns.to_string();
        }
        if let Some(owner) = self.field_owner.as_deref().filter(|o| !o.is_empty()) {
            s.field_owner = owner.to_string();
        }
        s
    }
}

/// Subjects from a multi-document YAML string; empty documents are skipped.
fn parse_subjects(src: &str) -> Result<Vec<ReconcileSubject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(src).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let subject: ReconcileSubject =
            serde_yaml::from_value(value).with_context(|| format!("document {}: not a subject", i + 1))?;
        if out.iter().any(|s: &ReconcileSubject| s.parent_link() == subject.parent_link()) {
            return Err(anyhow!("duplicate subject {}", subject.parent_link()));
        }
        out.push(subject);
    }
    Ok(out)
}

fn load_subjects(path: &Path) -> Result<Vec<ReconcileSubject>> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_subjects(&src).with_context(|| format!("parsing {}", path.display()))
}

fn load_document(path: &Path) -> Result<serde_json::Value> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    // YAML is a superset of JSON
    serde_yaml::from_str(&src).with_context(|| format!("parsing {}", path.display()))
}

pub(crate) fn ready_summary(s: &ReconcileSubject) -> String {
    match s.status.condition(TYPE_READY) {
        Some(c) => match &c.message {
            Some(m) => format!("Ready={:?} ({}: {})", c.status, c.reason, m),
            None => format!("Ready={:?} ({})", c.status, c.reason),
        },
        None => "Ready=<unset>".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = cli.settings();

    match &cli.command {
        Commands::Run { subjects, poll_secs, once } => {
            let subjects = load_subjects(subjects)?;
            info!(count = subjects.len(), "subjects loaded");
            let poll = poll_secs.map(Duration::from_secs).unwrap_or(settings.poll_interval);
            run::run(settings, subjects, poll, *once, cli.output).await?;
        }
        Commands::Observe { subject } => {
            let mut subject = load_subjects(subject)?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no subject in {}", subject.display()))?;
            let registry = Arc::new(CacheRegistry::new(settings.clone()));
            registry.set_register_fn(|_sub, _parent| Ok(()));
            let resolver: Arc<dyn EndpointResolver> = Arc::new(KubeResolver::new(settings.clone()));
            let reconciler = Reconciler::new(resolver, Arc::clone(&registry));
            let res = async {
                let external = reconciler.connector().connect(&subject).await?;
                external.observe(&mut subject).await
            }
            .await;
            registry.clear();
            let obs = res.map_err(|e| {
                error!(error = %e, subject = %subject.name, "observe failed");
                anyhow!(e)
            })?;
            match cli.output {
                Output::Human => {
                    println!("exists: {}  up-to-date: {}  {}", obs.exists, obs.up_to_date, ready_summary(&subject));
                    if !obs.diff.is_empty() {
                        println!("{}", obs.diff);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "exists": obs.exists,
                        "upToDate": obs.up_to_date,
                        "diff": obs.diff,
                        "status": subject.status,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Eval { expr, doc } => {
            let document = load_document(doc)?;
            let result = tether_cel::eval_document(expr, &document)?;
            match cli.output {
                Output::Human => println!("{}", result),
                Output::Json => println!("{}", serde_json::json!({ "result": result })),
            }
        }
    }
    Ok(())
}
