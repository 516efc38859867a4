//! TLS ClientHello parsing
//!
//! Only the first handshake record is inspected. The parser validates the record
//! header, walks the ClientHello body, and returns the `host_name` entry of the
//! server_name extension if the client sent one.

use thiserror::Error;
use tracing::trace;

/// TLS record header: content type (1), version (2), length (2)
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record we accept (TLSPlaintext limit plus expansion allowance)
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// ClientHello parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("Unsupported record version {0:#04x}.{1:#04x}")]
    UnsupportedVersion(u8, u8),

    #[error("Invalid record length: {0}")]
    InvalidRecordLength(usize),

    #[error("Not a ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),

    #[error("ClientHello truncated")]
    Truncated,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// Validate a record header and return the payload length it declares
pub fn record_payload_len(header: &[u8]) -> Result<usize, SniError> {
    if header.len() < RECORD_HEADER_LEN {
        return Err(SniError::Truncated);
    }
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(header[0]));
    }
    if header[1] != 0x03 {
        return Err(SniError::UnsupportedVersion(header[1], header[2]));
    }

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(SniError::InvalidRecordLength(len));
    }
    Ok(len)
}

/// Extract the server name from a complete handshake record
///
/// `record` must start with the record header and hold at least the declared
/// payload. Returns `Ok(None)` for a well-formed ClientHello without SNI.
pub fn extract_sni(record: &[u8]) -> Result<Option<String>, SniError> {
    let payload_len = record_payload_len(record)?;
    let payload = record
        .get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len)
        .ok_or(SniError::Truncated)?;

    let mut cur = Cursor::new(payload);

    let msg_type = cur.u8()?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(msg_type));
    }
    // Fragmented ClientHellos (body spread over several records) are not supported
    let body_len = cur.u24()?;
    let mut body = Cursor::new(cur.take(body_len)?);

    // legacy_version + random
    body.skip(2 + 32)?;
    let session_id_len = body.u8()? as usize;
    body.skip(session_id_len)?;
    let cipher_suites_len = body.u16()? as usize;
    body.skip(cipher_suites_len)?;
    let compression_len = body.u8()? as usize;
    body.skip(compression_len)?;

    // SSLv3-style hello without extensions
    if body.is_empty() {
        return Ok(None);
    }

    let extensions_len = body.u16()? as usize;
    let mut extensions = Cursor::new(body.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_data).map(Some);
        }
    }

    Ok(None)
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut ext = Cursor::new(data);
    let list_len = ext.u16()? as usize;
    let mut list = Cursor::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;

        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name)
            .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

        if hostname.is_empty() {
            return Err(SniError::InvalidSni("Empty hostname".to_string()));
        }

        trace!("Extracted SNI hostname: {}", hostname);
        return Ok(hostname);
    }

    Err(SniError::InvalidSni("No host_name entry".to_string()))
}

/// Bounds-checked big-endian reader over a byte slice
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if n > self.buf.len() {
            return Err(SniError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, SniError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}
