use std::collections::BTreeMap;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use keel_core::{Resource, ResourceKind};
use keel_reconcile::{ReconcileConfig, Reconciler, Teardown};
use keel_store::{ListParams, ResourceClient};
use keel_transport::{ClusterConfig, KubeTransport, Transport};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (default: all namespaces for `ls`, `default` otherwise)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long = "context", global = true, env = "KEEL_CONTEXT")]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects of a kind
    Ls {
        /// Kind name ("pods", "Deployment") or "group/version/Kind" for custom kinds
        kind: String,
        /// Label selector, e.g. "app=demo,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Fetch one object
    Get { kind: String, name: String },
    /// Reconcile every document of a manifest toward its desired state
    Apply {
        /// Manifest path, or "-" for stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Objects reconciled at once
        #[arg(long = "concurrency", default_value_t = 4)]
        concurrency: usize,
    },
    /// Delete one object; an already absent object is not an error
    Delete { kind: String, name: String },
}

/// Log to stderr, filtered by `KEEL_LOG` (default `info`).
fn init_tracing() {
    let filter = std::env::var("KEEL_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::from_str(&v).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `KEEL_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") else { return };
    let sock: std::net::SocketAddr = match addr.parse() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "ignoring KEEL_METRICS_ADDR");
            return;
        }
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(error = %e, "metrics exporter not installed");
    } else {
        info!(addr = %sock, "metrics exporter listening");
    }
}

/// Naive plural for kinds outside the built-in table.
fn plural_of(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') { format!("{}es", lower) } else { format!("{}s", lower) }
}

/// Resolve a kind given on the command line.
fn parse_kind(arg: &str) -> Result<ResourceKind> {
    if let Some(k) = ResourceKind::lookup(arg) {
        return Ok(k);
    }
    let parts: Vec<&str> = arg.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(ResourceKind::lookup_gvk(version, kind)
            .unwrap_or_else(|| ResourceKind::custom("", version, kind, &plural_of(kind), true))),
        [group, version, kind] => Ok(ResourceKind::lookup_gvk(&format!("{}/{}", group, version), kind)
            .unwrap_or_else(|| ResourceKind::custom(group, version, kind, &plural_of(kind), true))),
        _ => bail!("unknown kind {:?}; use a built-in name or group/version/Kind", arg),
    }
}

/// Resolve the kind a manifest document declares.
fn kind_of(r: &Resource) -> Result<ResourceKind> {
    if let Some(k) = ResourceKind::lookup_gvk(&r.api_version, &r.kind) {
        return Ok(k);
    }
    let (group, version) = match r.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None if !r.api_version.is_empty() => ("", r.api_version.as_str()),
        None => return Err(anyhow!("{}: apiVersion is required", r.key())),
    };
    Ok(ResourceKind::custom(group, version, &r.kind, &plural_of(&r.kind), true))
}

async fn connect(cli: &Cli) -> Result<Arc<dyn Transport>> {
    let mut cfg = ClusterConfig::from_env();
    if let Some(ctx) = &cli.context {
        cfg = cfg.with_context(ctx.clone());
    }
    let transport = KubeTransport::connect(&cfg)
        .await
        .with_context(|| format!("connecting with {}", cfg.kubeconfig.display()))?;
    Ok(Arc::new(transport))
}

fn read_manifest(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
    }
}

/// Cancel the token on Ctrl-C. In-flight calls finish; the loops stop at their next boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let transport = connect(&cli).await?;

    match &cli.command {
        Commands::Ls { kind, selector } => {
            let kind = parse_kind(kind)?;
            let ns = cli.namespace.clone().unwrap_or_default();
            info!(kind = %kind.kind, ns = %ns, "ls invoked");
            let client = ResourceClient::new(transport, kind);
            let params = ListParams { label_selector: selector.clone(), ..Default::default() };
            let listing = client.list_with(&ns, params);
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<32} {:<10} AGE", "NAMESPACE", "NAME", "VERSION");
                    let mut items = listing.stream();
                    while let Some(item) = items.try_next().await? {
                        let ns_col = if item.namespace().is_empty() { "-" } else { item.namespace() };
                        println!(
                            "{:<16} {:<32} {:<10} {}",
                            ns_col,
                            item.name(),
                            item.resource_version().unwrap_or("-"),
                            render_age(&item)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&listing.collect().await?)?),
            }
        }
        Commands::Get { kind, name } => {
            let kind = parse_kind(kind)?;
            let ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
            info!(kind = %kind.kind, ns = %ns, name = %name, "get invoked");
            let obj = ResourceClient::new(transport, kind).get(&ns, name).await?;
            match cli.output {
                Output::Human => print!("{}", keel_codec::to_yaml(&obj)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
            }
        }
        Commands::Apply { file, concurrency } => {
            let text = read_manifest(file)?;
            let docs = keel_codec::decode_yaml_documents(&text).with_context(|| format!("parsing {}", file))?;
            info!(file = %file, documents = docs.len(), "apply invoked");
            let default_ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());

            let mut by_kind: BTreeMap<String, (ResourceKind, Vec<Resource>)> = BTreeMap::new();
            for mut doc in docs {
                let kind = kind_of(&doc)?;
                if kind.namespaced && doc.namespace().is_empty() {
                    doc.metadata.namespace = Some(default_ns.clone());
                }
                by_kind
                    .entry(format!("{}/{}", kind.api_version(), kind.kind))
                    .or_insert_with(|| (kind, Vec::new()))
                    .1
                    .push(doc);
            }

            let cancel = cancel_on_ctrl_c();
            let config = ReconcileConfig::from_env();
            let mut failed = 0usize;
            let mut rows = Vec::new();
            for (_, (kind, desired)) in by_kind {
                let reconciler = Reconciler::new(ResourceClient::new(transport.clone(), kind), config.clone());
                for (key, res) in reconciler.apply_all(desired, *concurrency, &cancel).await {
                    match res {
                        Ok(done) => {
                            let rv = done.resource.resource_version().unwrap_or("").to_string();
                            if cli.output == Output::Human {
                                println!("{} converged (resourceVersion {}, attempts {})", key, rv, done.attempts);
                            }
                            rows.push(serde_json::json!({ "key": key.to_string(), "resourceVersion": rv, "attempts": done.attempts }));
                        }
                        Err(e) => {
                            failed += 1;
                            eprintln!("{}", e);
                            rows.push(serde_json::json!({ "key": key.to_string(), "error": e.to_string() }));
                        }
                    }
                }
            }
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            if failed > 0 {
                bail!("{} object(s) did not converge", failed);
            }
        }
        Commands::Delete { kind, name } => {
            let kind = parse_kind(kind)?;
            let ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
            info!(kind = %kind.kind, ns = %ns, name = %name, "delete invoked");
            let reconciler = Reconciler::new(ResourceClient::new(transport, kind), ReconcileConfig::from_env());
            let outcome = reconciler.teardown(&ns, name, &cancel_on_ctrl_c()).await?;
            match cli.output {
                Output::Human => match outcome {
                    Teardown::Deleted => println!("{} deleted", name),
                    Teardown::AlreadyAbsent => println!("{} already absent", name),
                },
                Output::Json => println!("{}", serde_json::json!({ "name": name, "outcome": outcome })),
            }
        }
    }

    Ok(())
}

fn render_age(r: &Resource) -> String {
    r.metadata
        .extra
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|created| format_age(chrono::Utc::now().signed_duration_since(created)))
        .unwrap_or_else(|| "-".to_string())
}

/// Two most significant units, or one below a minute.
fn format_age(age: chrono::Duration) -> String {
    let age = age.max(chrono::Duration::zero());
    let (d, h, m) = (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60);
    match (d, h, m) {
        (0, 0, 0) => format!("{}s", age.num_seconds()),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h{}m", h, m),
        (d, h, _) => format!("{}d{}h", d, h),
    }
}
