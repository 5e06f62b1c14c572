//! Protocol detection from the first bytes of a stream.
//!
//! Detection is a fixed-offset heuristic, not a parse: a TLS record header signature,
//! an HTTP version token at the end of the first line, or a known request method before
//! the first space. Anything else is `Other`. Nothing is consumed from the source.

use crate::peek::{MarkableRead, read_available};
use std::fmt;
use std::io;
use tracing::{debug, trace};

/// Number of bytes inspected by [`classify`]
pub const PREFIX_LEN: usize = 32;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const TLS_VERSION_MINOR: u8 = 0x01;

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const SP: u8 = b' ';
const TAG_OPEN: u8 = b'<';

/// Length of "GET / HTTP/1.1", the shortest plausible request line
const MIN_REQUEST_LINE: usize = 14;
/// Bytes before the first line feed searched for the version token
const VERSION_WINDOW: usize = 10;

/// Significant bytes collected by [`sniff_html`]
const HTML_WINDOW: usize = 32;
/// How far [`sniff_html`] may read past leading padding
const HTML_MARK_LIMIT: usize = 32 * 1024;
const HTML_READ_CHUNK: usize = 512;
const HTML_MARKERS: [&[u8]; 8] = [
    b"!doctype",
    b"!--",
    b"html",
    b"head",
    b"body",
    b"div",
    b"script",
    b"meta",
];

/// Outcome of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVerdict {
    /// Plain HTTP/1.x request
    Http,
    /// TLS handshake record
    Tls,
    /// Anything else
    Other,
    /// Fewer than [`PREFIX_LEN`] bytes were available, retry once more data arrived
    TooSmall,
}

impl ProtocolVerdict {
    /// Returns a string representation for metrics and logging
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVerdict::Http => "http",
            ProtocolVerdict::Tls => "tls",
            ProtocolVerdict::Other => "other",
            ProtocolVerdict::TooSmall => "too_small",
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolVerdict::TooSmall)
    }
}

impl fmt::Display for ProtocolVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`sniff_html`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtmlSniff {
    Html,
    NotHtml,
    /// The stream ended before enough significant bytes were seen
    Indeterminate,
}

#[derive(Debug)]
pub enum ClassifyError {
    /// The source cannot mark/reset, so it cannot be peeked
    PeekUnsupported,
    Io(io::Error),
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::PeekUnsupported => {
                write!(f, "Stream must support mark for protocol detection")
            }
            ClassifyError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ClassifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClassifyError::Io(e) => Some(e),
            ClassifyError::PeekUnsupported => None,
        }
    }
}

impl From<io::Error> for ClassifyError {
    fn from(err: io::Error) -> Self {
        ClassifyError::Io(err)
    }
}

/// HTTP request methods, including the WebDAV extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
    Propfind,
    Proppatch,
    Mkcol,
    Copy,
    Move,
    Lock,
    Unlock,
}

impl HttpMethod {
    /// Parses an upper-case method token
    pub fn parse(token: &str) -> Option<Self> {
        let method = match token {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "TRACE" => HttpMethod::Trace,
            "OPTIONS" => HttpMethod::Options,
            "CONNECT" => HttpMethod::Connect,
            "PATCH" => HttpMethod::Patch,
            "PROPFIND" => HttpMethod::Propfind,
            "PROPPATCH" => HttpMethod::Proppatch,
            "MKCOL" => HttpMethod::Mkcol,
            "COPY" => HttpMethod::Copy,
            "MOVE" => HttpMethod::Move,
            "LOCK" => HttpMethod::Lock,
            "UNLOCK" => HttpMethod::Unlock,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Propfind => "PROPFIND",
            HttpMethod::Proppatch => "PROPPATCH",
            HttpMethod::Mkcol => "MKCOL",
            HttpMethod::Copy => "COPY",
            HttpMethod::Move => "MOVE",
            HttpMethod::Lock => "LOCK",
            HttpMethod::Unlock => "UNLOCK",
        }
    }

    pub fn is_webdav(&self) -> bool {
        matches!(
            self,
            HttpMethod::Propfind
                | HttpMethod::Proppatch
                | HttpMethod::Mkcol
                | HttpMethod::Copy
                | HttpMethod::Move
                | HttpMethod::Lock
                | HttpMethod::Unlock
        )
    }

    /// Whether a request with this method may carry a body
    pub fn has_entity_body(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        ) || self.is_webdav()
    }

    /// Whether the response to this method may carry a body
    pub fn expects_response_body(&self) -> bool {
        *self != HttpMethod::Head
    }

    /// Methods accepted by the classifier as the start of a request
    fn starts_request(&self) -> bool {
        *self != HttpMethod::Trace
    }
}

/// Detects the protocol of a stream without consuming any of it
///
/// # Errors
///
/// Returns [`ClassifyError::PeekUnsupported`] if the source cannot mark/reset.
pub fn classify<R: MarkableRead + ?Sized>(source: &mut R) -> Result<ProtocolVerdict, ClassifyError> {
    if !source.mark_supported() {
        return Err(ClassifyError::PeekUnsupported);
    }

    let mut packet = [0u8; PREFIX_LEN];
    source.mark(PREFIX_LEN);
    let read = read_available(source, &mut packet);
    source.reset()?;
    let read = read?;

    if read < PREFIX_LEN {
        trace!(read, "Prefix too small for protocol detection");
        return Ok(ProtocolVerdict::TooSmall);
    }

    let verdict = classify_prefix(&packet);
    debug!(protocol = verdict.as_str(), "Classified stream prefix");
    Ok(verdict)
}

/// Applies the detection rules to already-peeked bytes
pub fn classify_prefix(prefix: &[u8]) -> ProtocolVerdict {
    if prefix.len() < PREFIX_LEN {
        return ProtocolVerdict::TooSmall;
    }

    let packet = &prefix[..PREFIX_LEN];
    if is_tls(packet) {
        ProtocolVerdict::Tls
    } else if is_http(packet) {
        ProtocolVerdict::Http
    } else {
        ProtocolVerdict::Other
    }
}

/// Record type handshake, protocol version 3.1
fn is_tls(packet: &[u8]) -> bool {
    packet[0] == TLS_HANDSHAKE && packet[1] == TLS_VERSION_MAJOR && packet[2] == TLS_VERSION_MINOR
}

fn is_http(packet: &[u8]) -> bool {
    if let Some(line_end) = packet.iter().position(|&b| b == LF)
        && line_end >= MIN_REQUEST_LINE
    {
        let version = &packet[line_end - VERSION_WINDOW..line_end];
        return contains_ignore_case(version, b"HTTP/");
    }

    // The first line may not have arrived completely, fall back to the method token
    let Some(space) = packet.iter().position(|&b| b == SP) else {
        return false;
    };
    if space == 0 {
        return false;
    }

    std::str::from_utf8(&packet[..space])
        .ok()
        .and_then(|token| {
            // Every control byte and space counts as padding around the token
            let token = token.trim_matches(|c: char| c <= ' ');
            HttpMethod::parse(&token.to_ascii_uppercase())
        })
        .is_some_and(|method| method.starts_request())
}

/// Checks whether the stream looks like an HTML document without consuming it
///
/// Leading CR/LF/SP, byte-order-mark bytes and NUL padding are skipped. The first
/// significant byte must open a tag followed by a known HTML marker.
pub fn sniff_html<R: MarkableRead + ?Sized>(source: &mut R) -> Result<HtmlSniff, ClassifyError> {
    if !source.mark_supported() {
        return Err(ClassifyError::PeekUnsupported);
    }

    source.mark(HTML_MARK_LIMIT);
    let collected = collect_significant(source);
    source.reset()?;

    let Some(first_bytes) = collected? else {
        return Ok(HtmlSniff::Indeterminate);
    };

    if first_bytes[0] != TAG_OPEN {
        return Ok(HtmlSniff::NotHtml);
    }

    let tag = &first_bytes[1..];
    let is_html = HTML_MARKERS
        .iter()
        .any(|marker| tag.len() >= marker.len() && tag[..marker.len()].eq_ignore_ascii_case(marker));

    Ok(if is_html {
        HtmlSniff::Html
    } else {
        HtmlSniff::NotHtml
    })
}

/// Reads until [`HTML_WINDOW`] significant bytes were seen, `None` if the stream ends first
fn collect_significant<R: MarkableRead + ?Sized>(
    source: &mut R,
) -> io::Result<Option<[u8; HTML_WINDOW]>> {
    let mut first_bytes = [0u8; HTML_WINDOW];
    let mut found = 0;
    let mut total = 0;
    let mut chunk = [0u8; HTML_READ_CHUNK];

    while total < HTML_MARK_LIMIT {
        let n = read_available(source, &mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        total += n;

        for &b in &chunk[..n] {
            // NUL bytes are dropped everywhere so UTF-16 text reads as ASCII
            if b == 0 || (found == 0 && is_padding(b)) {
                continue;
            }
            first_bytes[found] = b;
            found += 1;
            if found == HTML_WINDOW {
                return Ok(Some(first_bytes));
            }
        }

        if n < chunk.len() {
            return Ok(None);
        }
    }

    Ok(None)
}

fn is_padding(b: u8) -> bool {
    matches!(b, CR | LF | SP) || is_bom_byte(b)
}

/// Bytes that only appear in UTF-8 or UTF-16 byte order marks at the start of a document
fn is_bom_byte(b: u8) -> bool {
    matches!(b, 0xEF | 0xBB | 0xBF | 0xFE | 0xFF)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peek::PeekableReader;
    use std::io::Read;

    fn padded(head: &[u8]) -> Vec<u8> {
        let mut packet = head.to_vec();
        packet.resize(PREFIX_LEN.max(head.len()), b'x');
        packet
    }

    #[test]
    fn test_tls_signature() {
        let mut packet = vec![0x16, 0x03, 0x01];
        packet.extend_from_slice(&[0xAB; 29]);
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Tls);

        for i in 0..3 {
            let mut broken = packet.clone();
            broken[i] = 0x00;
            assert_eq!(classify_prefix(&broken), ProtocolVerdict::Other);
        }
    }

    #[test]
    fn test_http_request_line() {
        let mut packet = b"GET / HTTP/1.1\r\n".to_vec();
        packet.extend_from_slice(&[b'a'; 16]);
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Http);

        assert_eq!(classify_prefix(&padded(b"POST /x HTTP/1.0\r\n")), ProtocolVerdict::Http);

        // A status line keeps the version at the start, not before the line feed
        assert_eq!(
            classify_prefix(&padded(b"HTTP/1.1 200 OK\r\n")),
            ProtocolVerdict::Other
        );
    }

    #[test]
    fn test_http_method_without_line_end() {
        let packet = padded(b"PROPFIND /very/long/collection/path/that/is/cut");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Http);

        let packet = padded(b"delete /resource/that/does/not/fit/into/prefix");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Http);

        let packet = padded(b"FETCH /resource/that/does/not/fit/into/prefix");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Other);
    }

    #[test]
    fn test_long_line_without_version_is_other() {
        let packet = padded(b"GET /a/path/without/version\nmore");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Other);
    }

    #[test]
    fn test_short_line_falls_back_to_method() {
        let packet = padded(b"GET /\nHost: example.com\r\n\r\n");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Http);
    }

    #[test]
    fn test_control_bytes_around_method_ignored() {
        let packet = padded(b"\x01\tGET /a/path/that/is/long/enough/to/fill");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Http);

        // Non-ASCII whitespace is part of the token
        let packet = padded("\u{a0}GET /a/path/that/is/long/enough".as_bytes());
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Other);
    }

    #[test]
    fn test_classify_cursor_keeps_position() {
        let mut cursor = io::Cursor::new(padded(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n"));
        assert_eq!(classify(&mut cursor).unwrap(), ProtocolVerdict::Http);
        assert_eq!(cursor.position(), 0);

        let mut page = vec![b' '; 600];
        page.extend_from_slice(b"<!DOCTYPE html><html><head><title>x</title></head></html>");
        let mut cursor = io::Cursor::new(page);
        assert_eq!(sniff_html(&mut cursor).unwrap(), HtmlSniff::Html);
        assert_eq!(cursor.position(), 0);

        let mut short = io::Cursor::new(&b"<html>"[..]);
        assert_eq!(sniff_html(&mut short).unwrap(), HtmlSniff::Indeterminate);
        assert_eq!(short.position(), 0);

        // A cursor past its start cannot be peeked
        cursor.set_position(5);
        assert!(matches!(classify(&mut cursor), Err(ClassifyError::PeekUnsupported)));
        assert_eq!(cursor.position(), 5);
    }

    #[test]
    fn test_leading_space_is_not_a_method() {
        let packet = padded(b" GET / something without newline");
        assert_eq!(classify_prefix(&packet), ProtocolVerdict::Other);
    }

    #[test]
    fn test_short_prefix_is_too_small() {
        for len in 0..PREFIX_LEN {
            let packet = vec![0x16; len];
            assert_eq!(classify_prefix(&packet), ProtocolVerdict::TooSmall);
            let mut reader = PeekableReader::new(&packet[..]);
            assert_eq!(classify(&mut reader).unwrap(), ProtocolVerdict::TooSmall);
        }
    }

    #[test]
    fn test_classify_does_not_consume() {
        let payload = padded(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n");
        let mut reader = PeekableReader::new(&payload[..]);
        assert_eq!(classify(&mut reader).unwrap(), ProtocolVerdict::Http);

        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, payload);
    }

    #[test]
    fn test_classify_requires_mark() {
        struct Plain(&'static [u8]);
        impl Read for Plain {
            fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
                self.0.read(out)
            }
        }
        impl MarkableRead for Plain {}

        let err = classify(&mut Plain(b"GET / HTTP/1.1\r\n")).unwrap_err();
        assert!(matches!(err, ClassifyError::PeekUnsupported));
        let err = sniff_html(&mut Plain(b"<html>")).unwrap_err();
        assert!(matches!(err, ClassifyError::PeekUnsupported));
    }

    #[test]
    fn test_sniff_html_markers() {
        let cases: [(&[u8], HtmlSniff); 5] = [
            (b"<!DOCTYPE html><html><head></head><body></body></html>", HtmlSniff::Html),
            (b"\xEF\xBB\xBF\r\n  <HTML lang=\"en\"><head><title>x</title>", HtmlSniff::Html),
            (b"<div class=\"content\">some text to fill the window</div>", HtmlSniff::Html),
            (b"{\"json\": true, \"padding\": \"enough bytes here\"}", HtmlSniff::NotHtml),
            (b"<p>paragraph first, no marker right after the tag</p>", HtmlSniff::NotHtml),
        ];

        for (payload, expected) in cases {
            let mut reader = PeekableReader::new(payload);
            assert_eq!(sniff_html(&mut reader).unwrap(), expected);
        }
    }

    #[test]
    fn test_sniff_html_utf16() {
        let text = "<html><head><title>utf16 document</title></head>";
        let mut payload = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            payload.extend_from_slice(&unit.to_le_bytes());
        }

        let mut reader = PeekableReader::new(&payload[..]);
        assert_eq!(sniff_html(&mut reader).unwrap(), HtmlSniff::Html);
    }

    #[test]
    fn test_sniff_html_short_stream_is_indeterminate() {
        let mut reader = PeekableReader::new(&b"   <html>"[..]);
        assert_eq!(sniff_html(&mut reader).unwrap(), HtmlSniff::Indeterminate);
    }

    #[test]
    fn test_sniff_html_restores_position() {
        let mut payload = vec![b' '; 1000];
        payload.extend_from_slice(b"<!-- comment --><html><body>text</body></html>");
        let mut reader = PeekableReader::new(&payload[..]);

        assert_eq!(sniff_html(&mut reader).unwrap(), HtmlSniff::Html);
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, payload);
    }

    #[test]
    fn test_http_method_helpers() {
        assert_eq!(HttpMethod::parse("MKCOL"), Some(HttpMethod::Mkcol));
        assert_eq!(HttpMethod::parse("get"), None);
        assert!(HttpMethod::Lock.is_webdav());
        assert!(HttpMethod::Post.has_entity_body());
        assert!(HttpMethod::Copy.has_entity_body());
        assert!(!HttpMethod::Get.has_entity_body());
        assert!(!HttpMethod::Head.expects_response_body());
        assert!(HttpMethod::Get.expects_response_body());
        assert_eq!(HttpMethod::Options.as_str(), "OPTIONS");
    }
}
