//! Destination host extraction from the first record of a stream.
//!
//! TLS streams carry the host in the ClientHello server_name extension, plain HTTP
//! requests in the Host header. Both parsers work on peeked bytes only.

use std::fmt;
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniError {
    InvalidTlsVersion,
    InvalidHandshakeType,
    InvalidClientHello,
    InvalidSniFormat,
    MessageTruncated,
}

impl fmt::Display for SniError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniError::InvalidTlsVersion => write!(f, "Invalid TLS version"),
            SniError::InvalidHandshakeType => write!(f, "Invalid handshake type"),
            SniError::InvalidClientHello => write!(f, "Invalid Client Hello"),
            SniError::InvalidSniFormat => write!(f, "Invalid SNI format"),
            SniError::MessageTruncated => write!(f, "Message truncated"),
        }
    }
}

impl std::error::Error for SniError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Header block is not valid UTF-8 or the request line is malformed
    InvalidRequest,
    /// The Host header exists but its value is empty
    EmptyHost,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::InvalidRequest => write!(f, "Invalid HTTP request"),
            HostError::EmptyHost => write!(f, "Empty Host header"),
        }
    }
}

impl std::error::Error for HostError {}

fn read_u16(record: &[u8], pos: usize) -> usize {
    ((record[pos] as usize) << 8) | (record[pos + 1] as usize)
}

/// Extracts the server name from a TLS ClientHello record
///
/// `Ok(None)` means the ClientHello is well formed but carries no server_name extension.
pub fn extract_sni(record: &[u8]) -> Result<Option<String>, SniError> {
    if record.len() < 5 {
        return Err(SniError::MessageTruncated);
    }
    if record[0] != TLS_HANDSHAKE {
        return Err(SniError::InvalidHandshakeType);
    }
    if record[1] != TLS_VERSION_MAJOR {
        return Err(SniError::InvalidTlsVersion);
    }

    let record_length = read_u16(record, 3);
    if record.len() < record_length + 5 {
        debug!(
            expected = record_length + 5,
            got = record.len(),
            "TLS record truncated"
        );
        return Err(SniError::MessageTruncated);
    }
    let record = &record[..record_length + 5];

    let handshake_start = 5;
    if record.len() < handshake_start + 4 {
        return Err(SniError::MessageTruncated);
    }
    if record[handshake_start] != CLIENT_HELLO {
        return Err(SniError::InvalidClientHello);
    }

    let handshake_length = ((record[handshake_start + 1] as usize) << 16)
        | ((record[handshake_start + 2] as usize) << 8)
        | (record[handshake_start + 3] as usize);
    if record.len() < handshake_start + 4 + handshake_length {
        return Err(SniError::MessageTruncated);
    }

    // Skip version and random
    let mut pos = handshake_start + 4 + 2 + 32;

    // Session ID
    if record.len() < pos + 1 {
        return Err(SniError::MessageTruncated);
    }
    pos += 1 + record[pos] as usize;

    // Cipher suites
    if record.len() < pos + 2 {
        return Err(SniError::MessageTruncated);
    }
    pos += 2 + read_u16(record, pos);

    // Compression methods
    if record.len() < pos + 1 {
        return Err(SniError::MessageTruncated);
    }
    pos += 1 + record[pos] as usize;

    // No extensions at all
    if record.len() == pos {
        return Ok(None);
    }
    if record.len() < pos + 2 {
        return Err(SniError::MessageTruncated);
    }
    let extensions_length = read_u16(record, pos);
    pos += 2;

    if record.len() < pos + extensions_length {
        return Err(SniError::MessageTruncated);
    }

    let extensions_end = pos + extensions_length;
    while pos + 4 <= extensions_end {
        let extension_type = read_u16(record, pos) as u16;
        let extension_length = read_u16(record, pos + 2);
        pos += 4;

        if pos + extension_length > extensions_end {
            return Err(SniError::MessageTruncated);
        }

        if extension_type != SNI_EXTENSION {
            pos += extension_length;
            continue;
        }

        if extension_length < 2 {
            return Err(SniError::InvalidSniFormat);
        }
        let list_end = pos + extension_length;
        let sni_list_length = read_u16(record, pos);
        pos += 2;
        if sni_list_length + 2 > extension_length {
            return Err(SniError::InvalidSniFormat);
        }

        while pos + 3 <= list_end {
            let name_type = record[pos];
            let name_length = read_u16(record, pos + 1);
            pos += 3;

            if pos + name_length > list_end {
                return Err(SniError::MessageTruncated);
            }

            if name_type == SNI_HOST_NAME {
                return std::str::from_utf8(&record[pos..pos + name_length])
                    .map(|name| Some(name.to_ascii_lowercase()))
                    .map_err(|_| SniError::InvalidSniFormat);
            }
            pos += name_length;
        }
        return Err(SniError::InvalidSniFormat);
    }

    Ok(None)
}

/// Extracts the Host header from the start of an HTTP request
///
/// Only complete header lines are examined. The port, if any, is stripped and the
/// name lower-cased. `Ok(None)` means no Host header was found in the bytes given.
pub fn extract_http_host(request: &[u8]) -> Result<Option<String>, HostError> {
    // Work on complete lines only, the last one may be cut off by the peek window
    let complete = match request.iter().rposition(|&b| b == b'\n') {
        Some(end) => &request[..=end],
        None => return Ok(None),
    };

    let text = std::str::from_utf8(complete).map_err(|_| HostError::InvalidRequest)?;
    let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

    let request_line = lines.next().unwrap_or_default();
    if request_line.split(' ').count() < 3 {
        return Err(HostError::InvalidRequest);
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }

        let value = value.trim();
        if value.is_empty() {
            return Err(HostError::EmptyHost);
        }
        return Ok(Some(strip_port(value).to_ascii_lowercase()));
    }

    Ok(None)
}

/// Removes a trailing `:port`, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}
