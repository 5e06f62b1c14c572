use filterd_config::Config;
use filterd_core::metrics::render;
use filterd_core::{
    FilterContext, FilterDecision, HtmlSniff, PeekableReader, ProtocolVerdict, RuleSet, classify,
    run_inspector, sniff_html,
};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::Registry;
use std::error::Error;
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the JSON log subscriber. `RUST_LOG` overrides the default levels.
pub fn init_logging() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("filterd_core=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();
    Ok(())
}

/// Serves the registry in the Prometheus text format on `addr`
pub async fn serve_metrics(registry: Registry, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics endpoint listening on {}", addr);

    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };
            let registry = registry.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                    let registry = registry.clone();
                    async move {
                        let body = render(&registry)
                            .map_err(|e| format!("Metrics encoding error: {}", e))?;
                        Ok::<_, String>(Response::new(Full::new(bytes::Bytes::from(body))))
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Metrics connection error: {}", err);
                }
            });
        }
    });

    Ok(())
}

/// Runs the inspector listener until Ctrl-C, with the metrics endpoint if enabled
pub async fn inspect(config: Config) -> Result<(), Box<dyn Error>> {
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        serve_metrics(registry.clone(), metrics_addr).await?;
        Some(registry)
    } else {
        None
    };

    run_inspector(config, registry).await
}

/// Detection results for one file
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub result: Result<(ProtocolVerdict, HtmlSniff), String>,
}

/// Classifies every file on the dispatcher, one queue per file
///
/// Reports come back in the order of `files`.
pub async fn classify_files(context: &FilterContext, files: &[PathBuf]) -> Vec<FileReport> {
    let mut pending = Vec::with_capacity(files.len());

    for path in files {
        let (tx, rx) = oneshot::channel();
        let task_path = path.clone();
        context
            .dispatcher()
            .submit(&path.to_string_lossy(), move || {
                let _ = tx.send(classify_file(&task_path));
                Ok(())
            });
        pending.push((path.clone(), rx));
    }

    let mut reports = Vec::with_capacity(pending.len());
    for (path, rx) in pending {
        let result = rx
            .await
            .unwrap_or_else(|_| Err("classification task did not complete".to_string()));
        reports.push(FileReport { path, result });
    }
    reports
}

fn classify_file(path: &Path) -> Result<(ProtocolVerdict, HtmlSniff), String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut reader = PeekableReader::new(file);
    let verdict = classify(&mut reader).map_err(|e| e.to_string())?;
    let html = sniff_html(&mut reader).map_err(|e| e.to_string())?;
    Ok((verdict, html))
}

/// Evaluates each host against the rule set
pub fn match_hosts(rules: &RuleSet, hosts: &[String]) -> Vec<(String, FilterDecision)> {
    hosts
        .iter()
        .map(|host| {
            let host = host.trim().to_ascii_lowercase();
            let decision = rules.evaluate(&host);
            (host, decision)
        })
        .collect()
}

pub fn format_decision(decision: &FilterDecision) -> String {
    match decision {
        FilterDecision::Filter { list } => format!("filter ({})", list),
        other => other.as_str().to_string(),
    }
}

pub fn format_sniff(sniff: HtmlSniff) -> &'static str {
    match sniff {
        HtmlSniff::Html => "html",
        HtmlSniff::NotHtml => "not_html",
        HtmlSniff::Indeterminate => "indeterminate",
    }
}
