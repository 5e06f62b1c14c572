//! Per-connection inspection: protocol, destination host and filter decision
//!
//! [`FilterContext`] carries every shared component an inspection needs. It is built
//! once at startup and cloned into whatever runs inspections.

use crate::buffer::{BufferPool, PooledBuffer};
use crate::dispatcher::Dispatcher;
use crate::host::{extract_http_host, extract_sni};
use crate::metrics::InspectMetrics;
use crate::peek::MarkableRead;
use crate::protocol::{ClassifyError, ProtocolVerdict, classify};
use crate::rules::{FilterDecision, RuleSet};
use filterd_config::Config;
use prometheus::Registry;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// TLS record header length
const TLS_HEADER_LEN: usize = 5;
const HEADER_BLOCK_END: &[u8] = b"\r\n\r\n";

#[derive(Debug)]
pub enum InspectError {
    Classify(ClassifyError),
    Io(io::Error),
}

impl fmt::Display for InspectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectError::Classify(e) => write!(f, "Classification failed: {}", e),
            InspectError::Io(e) => write!(f, "I/O error while peeking: {}", e),
        }
    }
}

impl std::error::Error for InspectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InspectError::Classify(e) => Some(e),
            InspectError::Io(e) => Some(e),
        }
    }
}

impl From<ClassifyError> for InspectError {
    fn from(err: ClassifyError) -> Self {
        InspectError::Classify(err)
    }
}

impl From<io::Error> for InspectError {
    fn from(err: io::Error) -> Self {
        InspectError::Io(err)
    }
}

impl InspectError {
    fn kind(&self) -> &'static str {
        match self {
            InspectError::Classify(ClassifyError::PeekUnsupported) => "peek_unsupported",
            InspectError::Classify(ClassifyError::Io(_)) | InspectError::Io(_) => "io",
        }
    }
}

/// What an inspection found out about a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub protocol: ProtocolVerdict,
    /// Destination host, lower-cased, when the first record named one
    pub host: Option<String>,
    pub decision: FilterDecision,
}

impl Inspection {
    fn pass_through(protocol: ProtocolVerdict, host: Option<String>) -> Self {
        Self {
            protocol,
            host,
            decision: FilterDecision::PassThrough,
        }
    }
}

/// Inspects streams against a rule set
///
/// Every byte read is given back through mark/reset, so the stream can be handed on
/// untouched afterwards.
#[derive(Clone)]
pub struct ConnectionInspector {
    pool: BufferPool,
    rules: Arc<RuleSet>,
    metrics: Option<InspectMetrics>,
}

impl ConnectionInspector {
    pub fn new(pool: BufferPool, rules: Arc<RuleSet>) -> Self {
        Self {
            pool,
            rules,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: InspectMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inspect<R: MarkableRead + ?Sized>(&self, source: &mut R) -> Result<Inspection, InspectError> {
        let result = self.inspect_inner(source);

        if let Some(ref metrics) = self.metrics {
            match &result {
                Ok(inspection) => {
                    metrics
                        .connections
                        .with_label_values(&[inspection.protocol.as_str()])
                        .inc();
                    metrics
                        .decisions
                        .with_label_values(&[inspection.decision.as_str()])
                        .inc();
                }
                Err(e) => metrics.errors.with_label_values(&[e.kind()]).inc(),
            }
        }

        result
    }

    fn inspect_inner<R: MarkableRead + ?Sized>(&self, source: &mut R) -> Result<Inspection, InspectError> {
        let protocol = classify(source)?;
        if !matches!(protocol, ProtocolVerdict::Http | ProtocolVerdict::Tls) {
            trace!(protocol = protocol.as_str(), "No host to extract");
            return Ok(Inspection::pass_through(protocol, None));
        }

        let record = self.peek_first_record(source, protocol)?;
        let host = match protocol {
            ProtocolVerdict::Tls => extract_sni(record.content()).unwrap_or_else(|e| {
                debug!(error = %e, "Could not extract SNI from ClientHello");
                None
            }),
            _ => extract_http_host(record.content()).unwrap_or_else(|e| {
                debug!(error = %e, "Could not extract Host header");
                None
            }),
        };
        record.release();

        let Some(host) = host else {
            return Ok(Inspection::pass_through(protocol, None));
        };

        let decision = self.rules.evaluate(&host);
        debug!(
            host = host.as_str(),
            protocol = protocol.as_str(),
            decision = decision.as_str(),
            "Evaluated host"
        );

        Ok(Inspection {
            protocol,
            host: Some(host),
            decision,
        })
    }

    /// Reads the first TLS record or HTTP header block into a pooled buffer and
    /// rewinds the source. Stops early at end of stream, on a read timeout or once the
    /// buffer is full.
    fn peek_first_record<R: MarkableRead + ?Sized>(
        &self,
        source: &mut R,
        protocol: ProtocolVerdict,
    ) -> io::Result<PooledBuffer> {
        let mut record = self.pool.acquire();
        source.mark(record.capacity());

        let filled = fill_record(&mut record, source, protocol);
        source.reset()?;
        filled?;

        trace!(bytes = record.content_length(), "Peeked first record");
        Ok(record)
    }
}

fn fill_record<R: MarkableRead + ?Sized>(
    record: &mut PooledBuffer,
    source: &mut R,
    protocol: ProtocolVerdict,
) -> io::Result<()> {
    while record.bytes_left() > 0 && !record_complete(record.content(), protocol) {
        match record.fill_from(source) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn record_complete(content: &[u8], protocol: ProtocolVerdict) -> bool {
    match protocol {
        ProtocolVerdict::Tls => {
            content.len() >= TLS_HEADER_LEN
                && content.len()
                    >= TLS_HEADER_LEN + (((content[3] as usize) << 8) | content[4] as usize)
        }
        _ => content
            .windows(HEADER_BLOCK_END.len())
            .any(|window| window == HEADER_BLOCK_END),
    }
}

impl fmt::Debug for ConnectionInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInspector")
            .field("pool", &self.pool)
            .field("lists", &self.rules.list_names())
            .finish()
    }
}

/// Shared components of the filtering pipeline
#[derive(Clone)]
pub struct FilterContext {
    pool: BufferPool,
    dispatcher: Dispatcher,
    rules: Arc<RuleSet>,
    metrics: Option<InspectMetrics>,
}

impl FilterContext {
    pub fn new(pool: BufferPool, dispatcher: Dispatcher, rules: Arc<RuleSet>) -> Self {
        Self {
            pool,
            dispatcher,
            rules,
            metrics: None,
        }
    }

    /// Builds every component from configuration, registering metrics when a registry
    /// is given. Dispatched tasks run on the blocking pool of `handle`.
    pub fn from_config(
        config: &Config,
        handle: Handle,
        registry: Option<&Registry>,
    ) -> Result<Self, prometheus::Error> {
        let rules = Arc::new(RuleSet::from_config(config));
        let pool_config = &config.buffer_pool;

        let Some(registry) = registry else {
            let pool = BufferPool::with_capacity(pool_config.array_size, pool_config.max_pool_size);
            return Ok(Self::new(pool, Dispatcher::new(handle), rules));
        };

        let pool = BufferPool::with_metrics(
            pool_config.array_size,
            pool_config.max_pool_size,
            registry,
        )?;
        let dispatcher = Dispatcher::with_metrics(handle, registry)?;
        let metrics = InspectMetrics::new(registry)?;

        Ok(Self {
            pool,
            dispatcher,
            rules,
            metrics: Some(metrics),
        })
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    pub fn inspector(&self) -> ConnectionInspector {
        let inspector = ConnectionInspector::new(self.pool.clone(), Arc::clone(&self.rules));
        match self.metrics {
            Some(ref metrics) => inspector.with_metrics(metrics.clone()),
            None => inspector,
        }
    }

    /// Inspects `source` on the dispatcher under `key`
    ///
    /// Inspections sharing a key run one after another in submission order. `on_done`
    /// receives the source back, still positioned at its first byte.
    pub fn submit_inspection<S, F>(&self, key: &str, mut source: S, on_done: F)
    where
        S: MarkableRead + Send + 'static,
        F: FnOnce(S, Result<Inspection, InspectError>) + Send + 'static,
    {
        let inspector = self.inspector();
        self.dispatcher.submit(key, move || {
            let result = inspector.inspect(&mut source);
            on_done(source, result);
            Ok(())
        });
    }
}

impl fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext")
            .field("pool", &self.pool)
            .field("dispatcher", &self.dispatcher)
            .field("lists", &self.rules.list_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peek::PeekableReader;
    use crate::rules::FilterList;
    use std::io::Read;

    fn rules() -> Arc<RuleSet> {
        let lists = vec![FilterList {
            name: "ads".to_string(),
            enabled: true,
            patterns: vec!["*.ads.example.com".to_string()],
        }];
        Arc::new(RuleSet::load(&lists, &["safe.ads.example.com".to_string()]))
    }

    fn inspector() -> ConnectionInspector {
        ConnectionInspector::new(BufferPool::new(4096), rules())
    }

    fn client_hello(domain: &str) -> Vec<u8> {
        let name = domain.as_bytes();
        let mut extensions = vec![0x00, 0x00];
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x11; 32]);
        body.push(0x00);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_tls_host_filtered() {
        let data = client_hello("tracker.ads.example.com");
        let mut reader = PeekableReader::new(&data[..]);

        let inspection = inspector().inspect(&mut reader).unwrap();
        assert_eq!(inspection.protocol, ProtocolVerdict::Tls);
        assert_eq!(inspection.host.as_deref(), Some("tracker.ads.example.com"));
        assert_eq!(
            inspection.decision,
            FilterDecision::Filter {
                list: "ads".to_string()
            }
        );

        // Nothing was consumed
        let mut replay = Vec::new();
        reader.read_to_end(&mut replay).unwrap();
        assert_eq!(replay, data);
    }

    #[test]
    fn test_http_whitelisted_host() {
        let data = b"GET /pixel.gif HTTP/1.1\r\nHost: safe.ads.example.com\r\nAccept: */*\r\n\r\n";
        let mut reader = PeekableReader::new(&data[..]);

        let inspection = inspector().inspect(&mut reader).unwrap();
        assert_eq!(inspection.protocol, ProtocolVerdict::Http);
        assert_eq!(inspection.decision, FilterDecision::Whitelisted);
    }

    #[test]
    fn test_unknown_protocol_passes_through() {
        let data = [0x42u8; 64];
        let mut reader = PeekableReader::new(&data[..]);

        let inspection = inspector().inspect(&mut reader).unwrap();
        assert_eq!(inspection.protocol, ProtocolVerdict::Other);
        assert_eq!(inspection.host, None);
        assert_eq!(inspection.decision, FilterDecision::PassThrough);
    }

    #[test]
    fn test_short_stream_too_small() {
        let mut reader = PeekableReader::new(&b"GET / HTTP/1.1\r\n"[..]);
        let inspection = inspector().inspect(&mut reader).unwrap();
        assert_eq!(inspection.protocol, ProtocolVerdict::TooSmall);
        assert!(inspection.protocol.is_retryable());
    }

    #[test]
    fn test_http_without_host_passes_through() {
        let data = b"GET /index.html HTTP/1.0\r\nUser-Agent: curl/8.0\r\n\r\n";
        let mut reader = PeekableReader::new(&data[..]);
        let inspection = inspector().inspect(&mut reader).unwrap();
        assert_eq!(inspection.protocol, ProtocolVerdict::Http);
        assert_eq!(inspection.decision, FilterDecision::PassThrough);
    }

    #[test]
    fn test_record_complete() {
        assert!(!record_complete(&[0x16, 0x03, 0x01, 0x00], ProtocolVerdict::Tls));
        assert!(record_complete(&[0x16, 0x03, 0x01, 0x00, 0x01, 0xFF], ProtocolVerdict::Tls));
        assert!(!record_complete(b"GET / HTTP/1.1\r\n", ProtocolVerdict::Http));
        assert!(record_complete(b"GET / HTTP/1.1\r\n\r\n", ProtocolVerdict::Http));
    }

    #[test]
    fn test_metrics_counted() {
        let registry = Registry::new();
        let inspector = inspector().with_metrics(InspectMetrics::new(&registry).unwrap());

        let data = client_hello("www.example.org");
        inspector.inspect(&mut PeekableReader::new(&data[..])).unwrap();

        let text = crate::metrics::render(&registry).unwrap();
        assert!(text.contains("filterd_connections_total{protocol=\"tls\"} 1"));
        assert!(text.contains("filterd_decisions_total{decision=\"pass_through\"} 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_inspection_returns_source() {
        let config = Config::parse(
            r#"
listen_addrs: ["127.0.0.1:0"]
timeouts:
  read: 5
  idle: 60
metrics:
  enabled: false
  address: "127.0.0.1:0"
filter_lists:
  - name: ads
    patterns: ["*.ads.example.com"]
"#,
        )
        .unwrap();
        let context = FilterContext::from_config(&config, Handle::current(), None).unwrap();

        let data = client_hello("x.ads.example.com");
        let expected = data.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        context.submit_inspection(
            "10.0.0.1",
            PeekableReader::new(std::io::Cursor::new(data)),
            move |mut source, result| {
                let mut replay = Vec::new();
                source.read_to_end(&mut replay).unwrap();
                let _ = tx.send((result.unwrap(), replay));
            },
        );

        let (inspection, replay) = rx.await.unwrap();
        assert_eq!(inspection.decision.as_str(), "filter");
        assert_eq!(replay, expected);
    }
}
