//! Server name extraction from a peeked TLS ClientHello
//!
//! Intercepting listeners peek at the ClientHello before the handshake so
//! the certificate for the requested name can be issued off the runtime.
//! The bytes are only peeked; the TLS stack reads them again afterwards.

use std::time::Duration;

use log::trace;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};

/// TLS record header size
const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext TLS record
const MAX_RECORD_LEN: usize = 16384;

const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;

/// Pause between two peeks at a partially received ClientHello
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// Result of looking for SNI in the first bytes of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniParse {
    /// The ClientHello names this server
    Found(String),
    /// Complete ClientHello without a server name
    Absent,
    /// More bytes are needed
    Incomplete,
    /// The bytes are not a TLS ClientHello
    NotTls,
}

/// Bounds-checked reader over the ClientHello
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }

    fn skip_vec8(&mut self) -> Option<()> {
        let len = self.u8()? as usize;
        self.take(len).map(|_| ())
    }

    fn skip_vec16(&mut self) -> Option<()> {
        let len = self.u16()? as usize;
        self.take(len).map(|_| ())
    }
}

/// Look for the server name in the first TLS record of `buf`
pub fn parse_client_hello_sni(buf: &[u8]) -> SniParse {
    if buf.len() < RECORD_HEADER_LEN {
        return if buf.first().is_some_and(|&b| b != HANDSHAKE_RECORD) {
            SniParse::NotTls
        } else {
            SniParse::Incomplete
        };
    }
    if buf[0] != HANDSHAKE_RECORD || buf[1] != 0x03 {
        return SniParse::NotTls;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return SniParse::NotTls;
    }
    let Some(record) = buf.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len) else {
        return SniParse::Incomplete;
    };

    match server_name(record) {
        Some(Some(name)) => SniParse::Found(name),
        Some(None) => SniParse::Absent,
        None => SniParse::NotTls,
    }
}

/// `None` when the record is malformed, `Some(None)` when there is no SNI
fn server_name(record: &[u8]) -> Option<Option<String>> {
    let mut c = Cursor::new(record);
    if c.u8()? != CLIENT_HELLO {
        return None;
    }
    let hello_len = c.u24()?;
    // A ClientHello fragmented over several records is parsed as far as it goes
    let hello = c.take(hello_len.min(record.len() - 4))?;

    let mut c = Cursor::new(hello);
    c.take(2)?; // client_version
    c.take(32)?; // random
    c.skip_vec8()?; // session_id
    c.skip_vec16()?; // cipher_suites
    c.skip_vec8()?; // compression_methods

    let Some(extensions_len) = c.u16() else {
        return Some(None);
    };
    let extensions = c.take(extensions_len as usize)?;

    let mut c = Cursor::new(extensions);
    while let Some(kind) = c.u16() {
        let len = c.u16()? as usize;
        let data = c.take(len)?;
        if kind != SERVER_NAME_EXTENSION {
            continue;
        }

        let mut names = Cursor::new(data);
        let list_len = names.u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while let Some(name_type) = list.u8() {
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == HOST_NAME_TYPE {
                return std::str::from_utf8(name).ok().map(|s| Some(s.to_string()));
            }
        }
        return Some(None);
    }

    Some(None)
}

/// Peek at the connection until the ClientHello's server name is known
///
/// Gives up after `wait` and returns `None` when the name cannot be
/// determined; the handshake then proceeds without pre-issuance.
pub async fn peek_server_name(stream: &TcpStream, wait: Duration) -> Option<String> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; RECORD_HEADER_LEN + MAX_RECORD_LEN];

    loop {
        let n = match timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                trace!("Peek failed: {}", e);
                return None;
            }
            Err(_) => return None,
        };
        if n == 0 {
            return None;
        }

        match parse_client_hello_sni(&buf[..n]) {
            SniParse::Found(name) => return Some(name),
            SniParse::Absent | SniParse::NotTls => return None,
            SniParse::Incomplete if n == buf.len() || Instant::now() >= deadline => return None,
            SniParse::Incomplete => sleep(PEEK_INTERVAL).await,
        }
    }
}
