use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use watt_api::{WatchConfig, Watcher};
use watt_core::{Resource, Selector};

#[derive(Parser, Debug)]
#[command(name = "watt", version, about = "Mirror cluster resources and print a snapshot whenever they change")]
struct Cli {
    /// Kind to watch (`pods`, `deploy`, `widgets.example.io`, ...); repeatable
    #[arg(short = 's', long = "source", required = true, action = ArgAction::Append)]
    sources: Vec<String>,

    /// Restrict namespaced kinds to one namespace (default: all namespaces)
    #[arg(short = 'n', long = "namespace", env = "WATT_NAMESPACE", default_value = "")]
    namespace: String,

    /// Minimum time between two snapshots, in milliseconds
    #[arg(long = "interval", default_value_t = 250)]
    interval: u64,

    /// Print the first snapshot and exit
    #[arg(long = "once", action = ArgAction::SetTrue)]
    once: bool,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Json)]
    output: Output,

    /// Field selector applied to every source (`metadata.name=foo,status.phase!=Failed`)
    #[arg(long = "fields", env = "WATT_FIELD_SELECTOR")]
    fields: Option<String>,

    /// Label selector applied to every source (`app=web,tier!=db`)
    #[arg(long = "labels", env = "WATT_LABEL_SELECTOR")]
    labels: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "WATT_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

/// Logs go to stderr so stdout carries only snapshots. `WATT_LOG` takes a
/// `tracing` filter directive; the default is `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("WATT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting metrics exporter on {addr}"))?;
    info!(%addr, "metrics: prometheus exporter listening");
    Ok(())
}

impl Cli {
    /// Environment defaults with the command-line selectors on top.
    fn watch_config(&self) -> WatchConfig {
        let mut config = WatchConfig::from_env();
        config.selector = Selector::new(self.fields.clone(), self.labels.clone());
        config
    }
}

/// Current contents of every source, keyed by plural resource name.
fn snapshot(watcher: &Watcher, sources: &[String]) -> BTreeMap<String, Vec<Resource>> {
    let mut out = BTreeMap::new();
    for source in sources {
        match watcher.resolve(source) {
            Ok(info) => {
                out.insert(info.plural, watcher.list(source));
            }
            Err(e) => warn!(source = %source, error = %e, "snapshot: skipping source"),
        }
    }
    out
}

fn render(snap: &BTreeMap<String, Vec<Resource>>, output: Output) -> Result<String> {
    match output {
        Output::Json => Ok(serde_json::to_string(snap)?),
        Output::Human => {
            let mut lines = vec![format!("{:<24} {:<16} {:<32} {}", "KIND", "NAMESPACE", "NAME", "VERSION")];
            for (plural, items) in snap {
                for item in items {
                    let ns = if item.namespace().is_empty() { "-" } else { item.namespace() };
                    lines.push(format!("{:<24} {:<16} {:<32} {}", plural, ns, item.name(), item.resource_version()));
                }
            }
            Ok(lines.join("\n"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics(cli.metrics_addr)?;
    let interval = Duration::from_millis(cli.interval.max(1));

    let config = cli.watch_config();
    if !config.selector.is_empty() {
        info!(fields = ?config.selector.fields, labels = ?config.selector.labels, "selectors applied");
    }
    let watcher = Watcher::connect(config).await.context("connecting to cluster")?;
    // one pending signal is enough: every snapshot reads the full current state
    let (tx, mut rx) = mpsc::channel::<()>(1);
    for source in &cli.sources {
        let tx = tx.clone();
        let key = watcher
            .watch_namespace(&cli.namespace, source, move |_: &Watcher| {
                let _ = tx.try_send(());
            })
            .with_context(|| format!("registering source {source:?}"))?;
        info!(source = %source, gvr = %key, "watch registered");
    }
    drop(tx);

    let mut runner = tokio::spawn({
        let watcher = watcher.clone();
        async move { watcher.wait().await }
    });

    let mut last: Option<Instant> = None;
    let mut outcome = Ok(());
    loop {
        tokio::select! {
            res = &mut runner => {
                outcome = match res {
                    Ok(r) => r.context("watching"),
                    Err(e) => Err(e).context("watch task"),
                };
                break;
            }
            maybe = rx.recv() => {
                if maybe.is_none() {
                    break;
                }
                if let Some(prev) = last {
                    let wait = interval.saturating_sub(prev.elapsed());
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                while rx.try_recv().is_ok() {}
                let snap = snapshot(&watcher, &cli.sources);
                println!("{}", render(&snap, cli.output)?);
                counter!("watt_snapshots_total", 1u64);
                debug!(kinds = snap.len(), "snapshot published");
                last = Some(Instant::now());
                if cli.once {
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping watches");
                break;
            }
        }
    }

    watcher.stop().await;
    if !runner.is_finished() {
        runner.abort();
    }
    if let Err(e) = &outcome {
        error!(error = %e, "watt exited with error");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(ns: &str, name: &str) -> Resource {
        Resource::try_from(json!({ "metadata": { "name": name, "namespace": ns, "resourceVersion": "3" } })).unwrap()
    }

    #[test]
    fn json_snapshot_is_keyed_by_plural() {
        let mut snap = BTreeMap::new();
        snap.insert("widgets".to_string(), vec![obj("default", "a")]);
        snap.insert("nodes".to_string(), vec![]);
        let out: serde_json::Value = serde_json::from_str(&render(&snap, Output::Json).unwrap()).unwrap();
        assert_eq!(out["nodes"], json!([]));
        assert_eq!(out["widgets"][0]["metadata"]["name"], "a");
    }

    #[test]
    fn human_snapshot_has_header_and_rows() {
        let mut snap = BTreeMap::new();
        snap.insert("widgets".to_string(), vec![obj("default", "a"), obj("", "b")]);
        let out = render(&snap, Output::Human).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("KIND"));
        assert!(lines[1].contains("default") && lines[1].contains(" a "));
        assert!(lines[2].contains(" - "));
    }

    #[test]
    fn cli_requires_a_source() {
        assert!(Cli::try_parse_from(["watt"]).is_err());
        let cli = Cli::try_parse_from(["watt", "-s", "pods", "--source", "svc", "--once"]).unwrap();
        assert_eq!(cli.sources, vec!["pods", "svc"]);
        assert_eq!(cli.interval, 250);
        assert!(cli.once);
        assert_eq!(cli.metrics_addr, None);
    }

    #[test]
    fn selector_flags_reach_watch_config() {
        let cli = Cli::try_parse_from([
            "watt", "-s", "pods", "--fields", "status.phase=Running", "--labels", "app=web",
            "--metrics-addr", "127.0.0.1:9100",
        ])
        .unwrap();
        let config = cli.watch_config();
        assert_eq!(config.selector.fields.as_deref(), Some("status.phase=Running"));
        assert_eq!(config.selector.labels.as_deref(), Some("app=web"));
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn malformed_metrics_address_is_rejected() {
        assert!(Cli::try_parse_from(["watt", "-s", "pods", "--metrics-addr", "nine-thousand"]).is_err());
    }
}
