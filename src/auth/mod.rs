//! Proxy authentication
//!
//! Authentication runs as an ordered chain of protocols built once from the
//! configuration. Each protocol looks at one request head and either lets
//! it through, challenges the client (the connection stays open for a
//! retry), or rejects it. Challenges and rejections are written through a
//! [`ResponseSink`], so the same protocol code serves plain HTTP requests
//! and raw CONNECT tunnels.

pub mod basic;
pub mod ntlm;
mod sink;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::PROXY_AUTHENTICATE;
use http::request::Parts;
use http::{HeaderMap, HeaderValue, StatusCode};

pub use basic::BasicAuth;
pub use ntlm::NtlmAuth;
pub use sink::{HttpResponseSink, ResponseSink, SocketSink};

use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;

/// Outcome of one authentication step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Proceed to the next protocol, then to the request itself
    Continue,
    /// A challenge was sent; the client may retry on the same connection
    Challenged,
    /// A terminal failure response was sent
    Rejected,
}

impl AuthFlow {
    /// Whether the request may proceed
    pub fn is_continue(&self) -> bool {
        matches!(self, AuthFlow::Continue)
    }
}

/// Authentication scheme that produced an [`AuthResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// HTTP Basic
    Basic,
    /// NTLM
    Ntlm,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Basic => write!(f, "Basic"),
            AuthScheme::Ntlm => write!(f, "NTLM"),
        }
    }
}

/// Identity established for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Scheme the identity came from
    pub scheme: AuthScheme,
    /// User name
    pub principal: String,
    /// Basic password
    pub password: Option<String>,
    /// NTLM domain
    pub domain: Option<String>,
    /// NTLM workstation
    pub workstation: Option<String>,
    /// Whether the identity was accepted
    pub authenticated: bool,
}

/// Per-connection state shared by all requests on one client connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// Client address
    pub peer: Option<SocketAddr>,
    /// Identity attached by the last authentication step
    pub auth: Option<AuthResult>,
}

impl ConnectionContext {
    /// Context for a freshly accepted connection
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            auth: None,
        }
    }

    /// Whether the connection holds an accepted identity from `scheme`
    pub fn is_authenticated(&self, scheme: AuthScheme) -> bool {
        self.auth
            .as_ref()
            .is_some_and(|auth| auth.scheme == scheme && auth.authenticated)
    }

    /// Short description of the connection's user for the traffic log
    pub fn principal(&self) -> &str {
        self.auth
            .as_ref()
            .filter(|auth| auth.authenticated)
            .map(|auth| auth.principal.as_str())
            .unwrap_or("-")
    }
}

/// One authentication protocol
#[derive(Debug, Clone, Copy)]
pub enum AuthProtocol {
    /// HTTP Basic
    Basic(BasicAuth),
    /// NTLM
    Ntlm(NtlmAuth),
}

impl AuthProtocol {
    /// Scheme implemented by this protocol
    pub fn scheme(&self) -> AuthScheme {
        match self {
            AuthProtocol::Basic(_) => AuthScheme::Basic,
            AuthProtocol::Ntlm(_) => AuthScheme::Ntlm,
        }
    }

    /// Run the protocol for one request head
    pub async fn authenticate<S: ResponseSink>(
        &self,
        head: &Parts,
        sink: &mut S,
        ctx: &mut ConnectionContext,
    ) -> Result<AuthFlow> {
        match self {
            AuthProtocol::Basic(basic) => basic.authenticate(head, sink, ctx).await,
            AuthProtocol::Ntlm(ntlm) => ntlm.authenticate(head, sink, ctx).await,
        }
    }
}

/// Ordered, immutable list of authentication protocols
///
/// Cloning is cheap; every connection shares the same list.
#[derive(Debug, Clone)]
pub struct AuthChain {
    protocols: Arc<[AuthProtocol]>,
}

impl Default for AuthChain {
    fn default() -> Self {
        Self {
            protocols: Arc::from(Vec::new()),
        }
    }
}

impl AuthChain {
    /// Build a chain from an explicit list of protocols
    ///
    /// Basic and NTLM exclude each other.
    pub fn new(protocols: Vec<AuthProtocol>) -> Result<Self> {
        let has = |scheme| protocols.iter().any(|p| p.scheme() == scheme);
        if has(AuthScheme::Basic) && has(AuthScheme::Ntlm) {
            return Err(ProxyError::Config(
                "Basic and NTLM authentication cannot be enabled together".to_string(),
            ));
        }
        Ok(Self {
            protocols: protocols.into(),
        })
    }

    /// Build the chain selected by the configuration
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut protocols = Vec::new();
        if config.basic {
            protocols.push(AuthProtocol::Basic(BasicAuth));
        }
        if config.ntlm {
            protocols.push(AuthProtocol::Ntlm(NtlmAuth));
        }
        Self::new(protocols)
    }

    /// Whether no authentication is configured
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Protocols in execution order
    pub fn protocols(&self) -> &[AuthProtocol] {
        &self.protocols
    }

    /// Run every protocol in order, stopping at the first that does not continue
    pub async fn run<S: ResponseSink>(
        &self,
        head: &Parts,
        sink: &mut S,
        ctx: &mut ConnectionContext,
    ) -> Result<AuthFlow> {
        for protocol in self.protocols.iter() {
            let flow = protocol.authenticate(head, sink, ctx).await?;
            if !flow.is_continue() {
                return Ok(flow);
            }
        }
        Ok(AuthFlow::Continue)
    }
}

/// Send a bodiless response, optionally carrying a `Proxy-Authenticate` challenge
pub(crate) async fn respond<S: ResponseSink>(
    sink: &mut S,
    status: StatusCode,
    challenge: Option<HeaderValue>,
) -> Result<()> {
    let mut headers = HeaderMap::new();
    if let Some(challenge) = challenge {
        headers.insert(PROXY_AUTHENTICATE, challenge);
    }
    sink.send_response(status, headers).await?;
    Ok(())
}

/// Answer a malformed or refused credential and stop the chain
///
/// The status comes from the error: `400` for protocol errors, `403` for
/// [`ProxyError::AuthRejected`].
pub(crate) async fn reject<S: ResponseSink>(sink: &mut S, reason: ProxyError) -> Result<AuthFlow> {
    log::debug!("Credentials refused: {}", reason);
    respond(sink, reason.status_code(), None).await?;
    Ok(AuthFlow::Rejected)
}
