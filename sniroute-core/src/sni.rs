//! TLS ClientHello inspection.
//!
//! Pure parsing over an accumulating byte buffer: the session reads from the
//! socket, appends, and asks again until a verdict is reached. This module
//! performs no I/O and never touches the connection.

use thiserror::Error;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const SNI_HOSTNAME: u8 = 0x00;

/// Largest TLSPlaintext body we accept. A ClientHello claiming more than
/// this is treated as hostile rather than buffered.
pub const MAX_RECORD_LEN: usize = 16384;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("not a TLS handshake record: 0x{0:02x}")]
    NotHandshake(u8),
    #[error("unsupported TLS version major: 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("TLS record length {0} exceeds limit")]
    RecordTooLarge(usize),
    #[error("not a ClientHello: handshake type 0x{0:02x}")]
    NotClientHello(u8),
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
    #[error("server name is not valid UTF-8")]
    InvalidHostname,
}

/// Outcome of inspecting the buffered prefix of a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum HelloVerdict {
    /// Not enough bytes buffered to decide yet.
    Incomplete,
    /// Complete ClientHello carrying a server_name hostname. `consumed` is
    /// the exact number of buffered bytes forming the record; they belong
    /// to the upstream and must be replayed there.
    Found { hostname: String, consumed: usize },
    /// Complete, well-formed ClientHello with no hostname to route by.
    NoSni { consumed: usize },
}

/// Inspect the buffered prefix of a connection for a routable hostname.
///
/// Returns [`HelloVerdict::Incomplete`] until enough bytes are present to
/// decide; feeding the same stream split at any boundary reaches the same
/// final verdict. Structural problems fail fast, before the record is
/// complete where possible.
pub fn inspect_client_hello(buf: &[u8]) -> Result<HelloVerdict, SniError> {
    if buf.is_empty() {
        return Ok(HelloVerdict::Incomplete);
    }
    if buf[0] != TLS_HANDSHAKE {
        return Err(SniError::NotHandshake(buf[0]));
    }
    if buf.len() < 2 {
        return Ok(HelloVerdict::Incomplete);
    }
    if buf[1] != TLS_VERSION_MAJOR {
        return Err(SniError::UnsupportedVersion(buf[1]));
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(HelloVerdict::Incomplete);
    }

    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if record_len > MAX_RECORD_LEN {
        return Err(SniError::RecordTooLarge(record_len));
    }
    if record_len < HANDSHAKE_HEADER_LEN {
        return Err(SniError::Malformed("record shorter than a handshake header"));
    }

    // The handshake type arrives long before the record completes, so a
    // ServerHello or alert never ties up the buffer.
    if buf.len() > RECORD_HEADER_LEN && buf[RECORD_HEADER_LEN] != CLIENT_HELLO {
        return Err(SniError::NotClientHello(buf[RECORD_HEADER_LEN]));
    }

    let consumed = RECORD_HEADER_LEN + record_len;
    if buf.len() < consumed {
        return Ok(HelloVerdict::Incomplete);
    }

    let hostname = parse_client_hello(&buf[RECORD_HEADER_LEN..consumed])?;
    Ok(match hostname {
        Some(hostname) => HelloVerdict::Found { hostname, consumed },
        None => HelloVerdict::NoSni { consumed },
    })
}

/// Walk a complete handshake record. `Ok(None)` means a well-formed
/// ClientHello without a server_name hostname.
fn parse_client_hello(record: &[u8]) -> Result<Option<String>, SniError> {
    if record[0] != CLIENT_HELLO {
        return Err(SniError::NotClientHello(record[0]));
    }
    let handshake_len = usize::from(record[1]) << 16
        | usize::from(record[2]) << 8
        | usize::from(record[3]);
    let body = record
        .get(HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + handshake_len)
        .ok_or(SniError::Malformed("handshake length overruns the record"))?;

    let mut r = Reader::new(body);
    r.skip(2)?; // legacy_version
    r.skip(32)?; // random
    let session_id_len = usize::from(r.u8()?);
    r.skip(session_id_len)?;
    let cipher_suites_len = usize::from(r.u16()?);
    r.skip(cipher_suites_len)?;
    let compression_methods_len = usize::from(r.u8()?);
    r.skip(compression_methods_len)?;

    // Pre-extensions ClientHello; nothing to route by.
    if r.remaining() == 0 {
        return Ok(None);
    }

    let extensions_len = usize::from(r.u16()?);
    let mut extensions = Reader::new(r.take(extensions_len)?);
    while extensions.remaining() >= 4 {
        let extension_type = extensions.u16()?;
        let extension_len = usize::from(extensions.u16()?);
        let data = extensions.take(extension_len)?;
        if extension_type == SNI_EXTENSION {
            // Other extensions are skipped by length, never parsed.
            return parse_server_name(data);
        }
    }
    Ok(None)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(data);
    let list_len = usize::from(r.u16()?);
    let mut names = Reader::new(r.take(list_len)?);
    while names.remaining() >= 3 {
        let name_type = names.u8()?;
        let name_len = usize::from(names.u16()?);
        let name = names.take(name_len)?;
        if name_type == SNI_HOSTNAME {
            if name.is_empty() {
                return Err(SniError::Malformed("empty server name"));
            }
            return match std::str::from_utf8(name) {
                Ok(hostname) => Ok(Some(hostname.to_string())),
                Err(_) => Err(SniError::InvalidHostname),
            };
        }
    }
    Ok(None)
}

/// Bounds-checked walker over a complete record slice. Any overrun here is
/// a length-field inconsistency, not missing data.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(SniError::Malformed("length field overruns its container"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(SniError::Malformed("length field overruns its container"))?;
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }
}
