//! Fake Corp Proxy command line tool

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use fake_corp_proxy::common::{init_logger, Result};
use fake_corp_proxy::config::{ConfigOverrides, ProxyConfig};
use fake_corp_proxy::tls::{CertificateProvider, RootAuthority};
use fake_corp_proxy::{Proxy, APP_NAME, VERSION};

/// Fake Corp Proxy: intercepting HTTP/HTTPS proxy with Basic and NTLM authentication
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Proxy port; the HTTPS listener uses the next one
    #[clap(short, long)]
    port: Option<u16>,

    /// Listen address
    #[clap(long)]
    bind_address: Option<IpAddr>,

    /// Require Basic proxy authentication
    #[clap(short, long)]
    basic: bool,

    /// Require NTLM proxy authentication
    #[clap(short, long)]
    ntlm: bool,

    /// Also listen for proxy clients over TLS
    #[clap(short = 's', long)]
    https: bool,

    /// Private key of the HTTPS listener
    #[clap(short, long)]
    key: Option<PathBuf>,

    /// Certificate of the HTTPS listener
    #[clap(short, long)]
    cert: Option<PathBuf>,

    /// Relay CONNECT tunnels instead of intercepting them
    #[clap(long)]
    no_intercept: bool,

    /// Directory of the root CA and issued certificates
    #[clap(long)]
    ca_dir: Option<PathBuf>,

    /// Load configuration from a JSON file
    #[clap(long)]
    config_file: Option<PathBuf>,

    /// Upstream connect timeout in seconds
    #[clap(long)]
    connect_timeout: Option<u64>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,

    /// Log every tunnel state change and connection
    #[clap(short, long)]
    verbose: bool,

    /// Disable logging
    #[clap(short = 'S', long)]
    silent: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_address: self.bind_address,
            port: self.port,
            basic: self.basic,
            ntlm: self.ntlm,
            https: self.https,
            key: self.key.clone(),
            cert: self.cert.clone(),
            no_intercept: self.no_intercept,
            ca_dir: self.ca_dir.clone(),
            connect_timeout: self.connect_timeout,
            log_level: self.log_level.clone(),
            verbose: self.verbose,
            silent: self.silent,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match ProxyConfig::load(args.config_file.as_deref()) {
        Ok(config) => config.merge(&args.overrides()),
        Err(e) => {
            eprintln!("{}: {}", APP_NAME, e);
            process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{}: {}", APP_NAME, e);
        process::exit(1);
    }

    init_logger(&config.log_filter());
    info!("Starting {} v{}", APP_NAME, VERSION);

    if let Err(e) = run(config).await {
        error!("{}", e);
        eprintln!("{}: {}", APP_NAME, e);
        process::exit(1);
    }
}

async fn run(config: ProxyConfig) -> Result<()> {
    let provider = if config.intercept {
        let authority = RootAuthority::load_or_generate(&config.ca_dir)?;
        info!("Root CA: {}", authority.cert_path().display());
        info!("Root CA SHA-256 fingerprint: {}", authority.fingerprint()?);
        info!("Trust this certificate in clients that should accept intercepted TLS");
        Some(Arc::new(CertificateProvider::new(
            Arc::new(authority),
            Some(config.certs_dir()),
        )))
    } else {
        warn!("TLS interception disabled, CONNECT tunnels are relayed as-is");
        None
    };

    let proxy = Proxy::new(Arc::new(config), provider)?;
    proxy.run().await
}
