//! NTLM proxy authentication
//!
//! Only the message exchange is implemented. The proxy never verifies the
//! NT/LM responses; the identity found in the AUTHENTICATE message is
//! accepted unless its user name carries a refused prefix.
//!
//! ```text
//! client                         proxy
//!   | CONNECT (no credentials)     |
//!   |----------------------------->|  407 Proxy-Authenticate: NTLM
//!   | NTLM <type 1 NEGOTIATE>      |
//!   |----------------------------->|  407 Proxy-Authenticate: NTLM <type 2 CHALLENGE>
//!   | NTLM <type 3 AUTHENTICATE>   |
//!   |----------------------------->|  continue
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::PROXY_AUTHORIZATION;
use http::request::Parts;
use http::{HeaderValue, StatusCode};
use log::debug;

use super::{reject, respond, AuthFlow, AuthResult, AuthScheme, ConnectionContext, ResponseSink};
use crate::common::{ProxyError, Result};

/// Signature opening every NTLM message
pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// Size of the CHALLENGE message sent to clients
pub const CHALLENGE_LEN: usize = 40;

/// Flags announced in the CHALLENGE message
pub const CHALLENGE_FLAGS: u32 = 0x0000_8201;

/// Fixed server challenge
pub const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];

/// User name prefixes that are never authenticated
pub const UNAUTHENTICATED_PREFIXES: [&str; 2] = ["unknown", "unauth"];

// Written as `00 28 00 00`, not the end of the message (`0x28`). The
// target name is empty, so clients never follow it.
const TARGET_NAME_OFFSET: u32 = 0x0000_2800;

// AUTHENTICATE message layout
const DOMAIN_FIELD: usize = 0x1C;
const USER_FIELD: usize = 0x24;
const WORKSTATION_FIELD: usize = 0x2C;
const FLAGS_OFFSET: usize = 0x3C;
const NEGOTIATE_UNICODE: u8 = 0x01;

/// NTLM message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Type 1, sent by the client to start the exchange
    Negotiate,
    /// Type 2, sent by the server
    Challenge,
    /// Type 3, carries the client identity
    Authenticate,
}

/// Identity carried by an AUTHENTICATE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmIdentity {
    /// User name
    pub user: String,
    /// Domain name
    pub domain: String,
    /// Workstation name
    pub workstation: String,
}

fn protocol_error(message: impl Into<String>) -> ProxyError {
    ProxyError::Protocol(message.into())
}

/// Decode a `Proxy-Authorization: NTLM <base64>` value into the raw message
pub fn decode_authorization(value: &str) -> Result<Vec<u8>> {
    let tokens: Vec<&str> = value.split(' ').collect();
    match tokens.as_slice() {
        ["NTLM", payload] => STANDARD
            .decode(payload)
            .map_err(|e| protocol_error(format!("Invalid NTLM payload: {}", e))),
        _ => Err(protocol_error("Authorization header is not \"NTLM <token>\"")),
    }
}

/// Validate the signature and read the message type
pub fn message_type(msg: &[u8]) -> Result<MessageType> {
    if msg.len() < 12 {
        return Err(protocol_error(format!("NTLM message too short: {} bytes", msg.len())));
    }
    if &msg[0..8] != NTLMSSP_SIGNATURE {
        return Err(protocol_error("Invalid NTLM signature"));
    }

    match read_u32(msg, 8)? {
        1 => Ok(MessageType::Negotiate),
        2 => Ok(MessageType::Challenge),
        3 => Ok(MessageType::Authenticate),
        other => Err(protocol_error(format!("Unknown NTLM message type {}", other))),
    }
}

/// Build the fixed CHALLENGE message
pub fn challenge_message() -> [u8; CHALLENGE_LEN] {
    let mut msg = [0u8; CHALLENGE_LEN];
    msg[0..8].copy_from_slice(NTLMSSP_SIGNATURE);
    msg[8..12].copy_from_slice(&2u32.to_le_bytes());
    // Target name: length 0, max length 0
    msg[12..16].copy_from_slice(&[0, 0, 0, 0]);
    msg[16..20].copy_from_slice(&TARGET_NAME_OFFSET.to_le_bytes());
    msg[20..24].copy_from_slice(&CHALLENGE_FLAGS.to_le_bytes());
    msg[24..32].copy_from_slice(&SERVER_CHALLENGE);
    // 32..40 reserved
    msg
}

/// `Proxy-Authenticate` value carrying the CHALLENGE message
pub fn challenge_header() -> String {
    format!("NTLM {}", STANDARD.encode(challenge_message()))
}

/// Extract the identity from an AUTHENTICATE message
pub fn parse_authenticate(msg: &[u8]) -> Result<NtlmIdentity> {
    if message_type(msg)? != MessageType::Authenticate {
        return Err(protocol_error("Not an NTLM AUTHENTICATE message"));
    }

    let flags = *msg
        .get(FLAGS_OFFSET)
        .ok_or_else(|| protocol_error("NTLM AUTHENTICATE message truncated before flags"))?;
    let unicode = flags & NEGOTIATE_UNICODE != 0;

    let decode = |field: usize| -> Result<String> {
        let raw = read_field(msg, field)?;
        if unicode {
            decode_utf16le(raw)
        } else {
            Ok(raw.iter().map(|&b| char::from(b)).collect())
        }
    };

    Ok(NtlmIdentity {
        domain: decode(DOMAIN_FIELD)?,
        user: decode(USER_FIELD)?,
        workstation: decode(WORKSTATION_FIELD)?,
    })
}

fn read_u16(msg: &[u8], offset: usize) -> Result<u16> {
    offset
        .checked_add(2)
        .and_then(|end| msg.get(offset..end))
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| protocol_error(format!("NTLM message truncated at offset {:#x}", offset)))
}

fn read_u32(msg: &[u8], offset: usize) -> Result<u32> {
    offset
        .checked_add(4)
        .and_then(|end| msg.get(offset..end))
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| protocol_error(format!("NTLM message truncated at offset {:#x}", offset)))
}

/// Slice a (length, max length, buffer offset) security buffer
fn read_field(msg: &[u8], field: usize) -> Result<&[u8]> {
    let len = read_u16(msg, field)? as usize;
    let offset = read_u32(msg, field + 4)? as usize;
    offset
        .checked_add(len)
        .and_then(|end| msg.get(offset..end))
        .ok_or_else(|| {
            protocol_error(format!(
                "NTLM field at {:#x} points outside the message ({} bytes at {:#x})",
                field, len, offset
            ))
        })
}

fn decode_utf16le(raw: &[u8]) -> Result<String> {
    if raw.len() % 2 != 0 {
        return Err(protocol_error("Odd-length UTF-16 field in NTLM message"));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| protocol_error("Invalid UTF-16 in NTLM message"))
}

/// NTLM proxy authentication protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct NtlmAuth;

impl NtlmAuth {
    /// Advance the NTLM exchange for one request
    ///
    /// A connection that already completed the exchange is let through
    /// without a header.
    pub async fn authenticate<S: ResponseSink>(
        &self,
        head: &Parts,
        sink: &mut S,
        ctx: &mut ConnectionContext,
    ) -> Result<AuthFlow> {
        let Some(value) = head.headers.get(PROXY_AUTHORIZATION) else {
            if ctx.is_authenticated(AuthScheme::Ntlm) {
                return Ok(AuthFlow::Continue);
            }
            debug!("No NTLM credentials, sending challenge");
            respond(
                sink,
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                Some(HeaderValue::from_static("NTLM")),
            )
            .await?;
            return Ok(AuthFlow::Challenged);
        };

        let message = value
            .to_str()
            .map_err(|_| protocol_error("Authorization header is not ASCII"))
            .and_then(decode_authorization)
            .and_then(|msg| message_type(&msg).map(|kind| (kind, msg)));

        let (kind, msg) = match message {
            Ok(parsed) => parsed,
            Err(e) => return reject(sink, e).await,
        };

        match kind {
            MessageType::Negotiate => {
                debug!("NTLM NEGOTIATE received, sending CHALLENGE");
                let challenge = HeaderValue::from_str(&challenge_header())
                    .map_err(|e| ProxyError::Other(e.to_string()))?;
                respond(sink, StatusCode::PROXY_AUTHENTICATION_REQUIRED, Some(challenge)).await?;
                Ok(AuthFlow::Challenged)
            }
            MessageType::Challenge => {
                reject(sink, protocol_error("NTLM CHALLENGE message received from a client")).await
            }
            MessageType::Authenticate => {
                let identity = match parse_authenticate(&msg) {
                    Ok(identity) => identity,
                    Err(e) => return reject(sink, e).await,
                };

                let authenticated = !identity.user.is_empty()
                    && !UNAUTHENTICATED_PREFIXES
                        .iter()
                        .any(|prefix| identity.user.starts_with(prefix));
                debug!(
                    "NTLM user {}\\{} from {} authenticated: {}",
                    identity.domain, identity.user, identity.workstation, authenticated
                );

                let user = identity.user.clone();
                ctx.auth = Some(AuthResult {
                    scheme: AuthScheme::Ntlm,
                    principal: identity.user,
                    password: None,
                    domain: Some(identity.domain),
                    workstation: Some(identity.workstation),
                    authenticated,
                });

                if !authenticated {
                    let reason = ProxyError::AuthRejected(format!("NTLM user {:?} refused", user));
                    return reject(sink, reason).await;
                }

                Ok(AuthFlow::Continue)
            }
        }
    }
}
