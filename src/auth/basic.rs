//! Basic proxy authentication

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::PROXY_AUTHORIZATION;
use http::request::Parts;
use http::{HeaderValue, StatusCode};
use log::debug;

use super::{reject, respond, AuthFlow, AuthResult, AuthScheme, ConnectionContext, ResponseSink};
use crate::common::{ProxyError, Result};

/// Username prefix that is never authenticated
pub const UNAUTHENTICATED_PREFIX: &str = "unknown";

/// Decoded `user:password` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// User name, may be empty
    pub user: String,
    /// Password, may be empty
    pub password: String,
}

/// Parse a full `Proxy-Authorization` value such as `Basic dXNlcjpwYXNz`
///
/// A value without a space is taken as the bare credential.
pub fn parse_authorization(value: &str) -> Result<BasicCredentials> {
    let token = match value.trim().split_once(' ') {
        Some((scheme, token)) => {
            if !scheme.eq_ignore_ascii_case("Basic") {
                return Err(ProxyError::Protocol(format!(
                    "Unexpected authorization scheme {:?}",
                    scheme
                )));
            }
            token.trim()
        }
        None => value.trim(),
    };

    decode_credentials(token)
}

/// Decode the credential part of a Basic header
///
/// A credential that already contains a colon is used verbatim, anything
/// else is base64-decoded first.
pub fn decode_credentials(token: &str) -> Result<BasicCredentials> {
    let decoded = if token.contains(':') {
        token.to_string()
    } else {
        let bytes = STANDARD
            .decode(token)
            .map_err(|e| ProxyError::Protocol(format!("Invalid base64 credentials: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|_| ProxyError::Protocol("Credentials are not valid UTF-8".to_string()))?
    };

    let (user, password) = decoded
        .split_once(':')
        .ok_or_else(|| ProxyError::Protocol("Credentials must be user:password".to_string()))?;

    Ok(BasicCredentials {
        user: user.to_string(),
        password: password.to_string(),
    })
}

/// Basic proxy authentication protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuth;

impl BasicAuth {
    /// Check the request's Basic credentials
    ///
    /// Challenges with `407` when no credentials are present, answers `400`
    /// for a malformed header and `403` for missing or refused credentials.
    pub async fn authenticate<S: ResponseSink>(
        &self,
        head: &Parts,
        sink: &mut S,
        ctx: &mut ConnectionContext,
    ) -> Result<AuthFlow> {
        let Some(value) = head.headers.get(PROXY_AUTHORIZATION) else {
            debug!("No Basic credentials, sending challenge");
            respond(
                sink,
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                Some(HeaderValue::from_static("Basic")),
            )
            .await?;
            return Ok(AuthFlow::Challenged);
        };

        let credentials = match value
            .to_str()
            .map_err(|_| ProxyError::Protocol("Authorization header is not ASCII".to_string()))
            .and_then(parse_authorization)
        {
            Ok(credentials) => credentials,
            Err(e) => return reject(sink, e).await,
        };

        if credentials.user.is_empty() || credentials.password.is_empty() {
            let reason = ProxyError::AuthRejected("Basic credentials without user or password".to_string());
            return reject(sink, reason).await;
        }

        let authenticated = !credentials.user.starts_with(UNAUTHENTICATED_PREFIX);
        debug!(
            "Basic user {} authenticated: {}",
            credentials.user, authenticated
        );

        let user = credentials.user.clone();
        ctx.auth = Some(AuthResult {
            scheme: AuthScheme::Basic,
            principal: credentials.user,
            password: Some(credentials.password),
            domain: None,
            workstation: None,
            authenticated,
        });

        if !authenticated {
            return reject(sink, ProxyError::AuthRejected(format!("Basic user {} refused", user))).await;
        }

        Ok(AuthFlow::Continue)
    }
}
