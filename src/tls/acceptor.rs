//! TLS acceptor creation

use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info};
use openssl::ssl::{NameType, SniError, SslAcceptor, SslAlert, SslFiletype, SslMethod};

use super::provider::{CertificateProvider, CertificateRecord};
use crate::common::Result;

/// Create the acceptor for the HTTPS proxy listener
///
/// # Example
///
/// ```no_run
/// # use std::path::Path;
/// # use fake_corp_proxy::tls::create_tls_acceptor;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let acceptor = create_tls_acceptor(
///     Path::new("certs/proxy.crt"),
///     Path::new("certs/proxy.key"),
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    acceptor.set_certificate_chain_file(cert_path)?;
    acceptor.set_private_key_file(key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;

    info!("HTTPS listener certificate loaded from {}", cert_path.display());
    Ok(acceptor.build())
}

/// Create the acceptor for an intercepting listener
///
/// `default` is presented when the client sends no server name. Otherwise
/// the server-name callback swaps in a context for the requested name,
/// issuing its certificate if it is not cached yet, and aborts the
/// handshake with a fatal alert when issuance fails.
pub fn create_intercepting_acceptor(
    provider: Arc<CertificateProvider>,
    default: &CertificateRecord,
) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

    let cert = default.certificate()?;
    let key = default.private_key()?;
    acceptor.set_certificate(&cert)?;
    acceptor.set_private_key(&key)?;
    acceptor.add_extra_chain_cert(provider.authority().certificate().clone())?;
    acceptor.check_private_key()?;

    acceptor.set_servername_callback(move |ssl, alert| {
        let Some(name) = ssl.servername(NameType::HOST_NAME).map(str::to_owned) else {
            return Ok(());
        };

        let context = provider
            .get_certificate(&name)
            .and_then(|record| provider.server_context(&record));

        match context {
            Ok(context) => match ssl.set_ssl_context(&context) {
                Ok(()) => {
                    debug!("SNI certificate for host {} selected", name);
                    Ok(())
                }
                Err(e) => {
                    error!("Error while switching to the SNI certificate for host {}: {}", name, e);
                    *alert = SslAlert::UNRECOGNIZED_NAME;
                    Err(SniError::ALERT_FATAL)
                }
            },
            Err(e) => {
                error!("Error while generating SNI certificate for host {}: {}", name, e);
                *alert = SslAlert::UNRECOGNIZED_NAME;
                Err(SniError::ALERT_FATAL)
            }
        }
    });

    Ok(acceptor.build())
}
