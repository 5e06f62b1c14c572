pub mod buffer;
pub mod dispatcher;
pub mod host;
pub mod inspector;
pub mod job;
pub mod metrics;
pub mod peek;
pub mod protocol;
pub mod rules;
pub mod wildcard;

pub use buffer::{BufferPool, CapacityError, PooledBuffer};
pub use dispatcher::{Dispatcher, TaskError, WorkerPool};
pub use inspector::{ConnectionInspector, FilterContext, InspectError, Inspection};
pub use job::{BackoffPolicy, FnJob, Job, JobOutcome, JobScheduler};
pub use peek::{MarkableRead, PeekableReader};
pub use protocol::{ClassifyError, HtmlSniff, ProtocolVerdict, classify, sniff_html};
pub use rules::{FilterDecision, RuleSet, RuleSource};
pub use wildcard::Wildcard;

use filterd_config::Config;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Accepts connections on every configured address and inspects each one
///
/// Connections from the same peer address are inspected one at a time. Decisions are
/// logged and counted, traffic is not relayed. Runs until Ctrl-C.
pub async fn run_inspector(
    config: Config,
    registry: Option<Registry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = FilterContext::from_config(&config, Handle::current(), registry.as_ref())?;
    let read_timeout = Duration::from_secs(config.timeouts.read);
    let idle_timeout = Duration::from_secs(config.timeouts.idle);

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!(
        lists = context.rules().list_names().len(),
        "Inspector started, waiting for connections..."
    );

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        if let Err(e) = accept_connection(&context, socket, addr, read_timeout, idle_timeout) {
                            warn!(peer = %addr, error = %e, "Could not prepare connection for inspection");
                        }
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    info!("Shutting down inspector");
    Ok(())
}

fn accept_connection(
    context: &FilterContext,
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    read_timeout: Duration,
    idle_timeout: Duration,
) -> std::io::Result<()> {
    let stream = socket.into_std()?;
    stream.set_nonblocking(false)?;
    // A zero duration is rejected by the socket API and means no timeout here
    stream.set_read_timeout((!read_timeout.is_zero()).then_some(read_timeout))?;

    debug!(peer = %addr, "New connection");
    let deadline = Instant::now() + idle_timeout;
    submit(context.clone(), addr, PeekableReader::new(stream), deadline, 0);
    Ok(())
}

/// Queues an inspection under the peer IP. A connection whose first bytes have not all
/// arrived is inspected again as long as it keeps sending and the idle deadline allows.
fn submit(
    context: FilterContext,
    addr: SocketAddr,
    source: PeekableReader<TcpStream>,
    deadline: Instant,
    seen: usize,
) {
    let key = addr.ip().to_string();
    let retry_context = context.clone();

    context.submit_inspection(&key, source, move |source, result| {
        let peer = addr.to_string();
        match result {
            Ok(inspection) if inspection.protocol.is_retryable() => {
                let buffered = source.buffered().len();
                if buffered > seen && Instant::now() < deadline {
                    debug!(peer, buffered, "Prefix incomplete, inspecting again");
                    submit(retry_context, addr, source, deadline, buffered);
                } else {
                    debug!(peer, buffered, "Connection stalled before protocol detection");
                }
            }
            Ok(inspection) => {
                info!(
                    peer,
                    protocol = inspection.protocol.as_str(),
                    host = inspection.host.as_deref().unwrap_or("-"),
                    decision = inspection.decision.as_str(),
                    "Connection inspected"
                );
            }
            Err(e) => {
                debug!(peer, error = %e, "Inspection failed");
            }
        }
    });
}
