mod agent;
mod config;
mod grpc;
mod naming;
mod network;
mod pki;
mod platform;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use agent::NodeAgent;
use config::{CaConfig, Environment, NodeAgentConfig};
use network::{CaGrpcClient, CaServer};
use pki::ca::{IstioCa, IstioCaOptions};
use platform::new_platform_client;

#[derive(Parser)]
#[command(name = "istio-auth")]
#[command(about = "Certificate authority and node agent for workload identities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Istio CA gRPC server
    Ca {
        /// Configuration file path (TOML); other flags are ignored when set
        #[arg(long)]
        config: Option<PathBuf>,

        /// gRPC listen address
        #[arg(long, default_value = "0.0.0.0:8060")]
        address: SocketAddr,

        /// Organization for the self-signed root certificate
        #[arg(long, default_value = "istio-ca")]
        org: String,

        /// Trust domain workload identities are minted under
        #[arg(long, default_value = "cluster.local")]
        trust_domain: String,

        /// TTL of issued workload certificates, in seconds
        #[arg(long, default_value_t = 3600)]
        cert_ttl: u64,

        /// TTL of the self-signed CA certificate, in seconds
        #[arg(long, default_value_t = 365 * 24 * 3600)]
        ca_cert_ttl: u64,

        /// Signing certificate file; a self-signed root is generated when unset
        #[arg(long)]
        signing_cert: Option<PathBuf>,

        /// Signing private key file
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Root certificate file
        #[arg(long)]
        root_cert: Option<PathBuf>,

        /// Intermediate certificate chain file, appended to issued certs
        #[arg(long)]
        cert_chain: Option<PathBuf>,

        /// Server TLS certificate file; the server is plaintext when unset
        #[arg(long)]
        tls_cert: Option<PathBuf>,

        /// Server TLS private key file
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },

    /// Run the node agent
    NodeAgent {
        /// Organization for the cert
        #[arg(long, default_value = "")]
        org: String,

        /// Size of generated private key
        #[arg(long = "key-size", default_value_t = 1024)]
        key_size: usize,

        /// Istio CA address
        #[arg(long = "ca-address", default_value = "istio-ca:8060")]
        ca_address: String,

        /// Node environment: onprem | gcp | aws
        #[arg(long, default_value = "onprem")]
        env: Environment,

        /// Identity to request a certificate for; taken from the platform
        /// when unset
        #[arg(long = "service-identity", default_value = "")]
        service_identity: String,

        /// Service identity certificate output location
        #[arg(long = "service-cert", default_value = "serviceIdentityCert.pem")]
        service_cert: PathBuf,

        /// Service identity private key output location
        #[arg(long = "service-priv-key", default_value = "serviceIdentityKey.pem")]
        service_priv_key: PathBuf,

        /// Node Agent identity cert file
        #[arg(long = "cert-chain", default_value = "/etc/certs/cert-chain.pem")]
        cert_chain: PathBuf,

        /// Node identity private key file
        #[arg(long = "key", default_value = "/etc/certs/key.pem")]
        key: PathBuf,

        /// Root certificate file
        #[arg(long = "root-cert", default_value = "/etc/certs/root-cert.pem")]
        root_cert: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Ca {
            config,
            address,
            org,
            trust_domain,
            cert_ttl,
            ca_cert_ttl,
            signing_cert,
            signing_key,
            root_cert,
            cert_chain,
            tls_cert,
            tls_key,
        } => {
            let ca_config = match config {
                Some(path) => CaConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => CaConfig {
                    listen_address: address,
                    org,
                    trust_domain,
                    cert_ttl_secs: cert_ttl,
                    ca_cert_ttl_secs: ca_cert_ttl,
                    self_signed: signing_cert.is_none(),
                    signing_cert_file: signing_cert,
                    signing_key_file: signing_key,
                    root_cert_file: root_cert,
                    cert_chain_file: cert_chain,
                    tls_cert_file: tls_cert,
                    tls_key_file: tls_key,
                },
            };
            run_ca(ca_config).await
        }

        Commands::NodeAgent {
            org,
            key_size,
            ca_address,
            env,
            service_identity,
            service_cert,
            service_priv_key,
            cert_chain,
            key,
            root_cert,
        } => {
            let na_config = NodeAgentConfig {
                ca_address,
                service_identity,
                service_identity_org: org,
                rsa_key_size: key_size,
                env,
                service_cert_file: service_cert,
                service_key_file: service_priv_key,
                cert_chain_file: cert_chain,
                platform_key_file: key,
                root_cert_file: root_cert,
                ..Default::default()
            };
            run_node_agent(na_config).await
        }
    }
}

async fn run_ca(config: CaConfig) -> Result<()> {
    config.validate()?;

    let ca = if config.self_signed {
        info!("Bootstrapping a self-signed Istio CA");
        IstioCa::new_self_signed(
            config.ca_cert_ttl(),
            config.cert_ttl(),
            &config.org,
            &config.trust_domain,
        )?
    } else {
        let (signing_cert_file, signing_key_file, root_cert_file) = match (
            &config.signing_cert_file,
            &config.signing_key_file,
            &config.root_cert_file,
        ) {
            (Some(cert), Some(key), Some(root)) => (cert, key, root),
            _ => anyhow::bail!(
                "signing cert, signing key and root cert files are required unless self-signed"
            ),
        };
        let signing_cert_pem = read_pem_file(signing_cert_file)?;
        let signing_key_pem = read_pem_file(signing_key_file)?;
        let root_cert_pem = read_pem_file(root_cert_file)?;
        let cert_chain_pem = match &config.cert_chain_file {
            Some(path) => read_pem_file(path)?,
            None => Vec::new(),
        };
        IstioCa::new(&IstioCaOptions {
            cert_chain_pem,
            cert_ttl: config.cert_ttl(),
            signing_cert_pem,
            signing_key_pem,
            root_cert_pem,
            trust_domain: config.trust_domain.clone(),
        })?
    };

    let tls_identity = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) => Some((read_pem_file(cert)?, read_pem_file(key)?)),
        _ => None,
    };

    CaServer::new(config.listen_address, Arc::new(ca), tls_identity)
        .start()
        .await
}

async fn run_node_agent(config: NodeAgentConfig) -> Result<()> {
    config.validate()?;

    let platform = new_platform_client(&config)?;
    let mut node_agent = NodeAgent::new(config, platform, Box::new(CaGrpcClient));

    info!("Starting Node Agent");
    tokio::select! {
        result = node_agent.start() => {
            if let Err(e) = &result {
                error!("Node agent terminated with error: {e}.");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down node agent");
            Ok(())
        }
    }
}

fn read_pem_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read cert file: {}", path.display()))
}
