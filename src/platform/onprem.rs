use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use super::{DialOptions, PlatformClient};
use crate::pki::validator::extract_spiffe_uri;

/// Platform client for nodes provisioned with certificate files on disk.
pub struct OnPremClient {
    cert_chain_file: PathBuf,
    key_file: PathBuf,
    root_cert_file: PathBuf,
}

impl OnPremClient {
    pub fn new(cert_chain_file: PathBuf, key_file: PathBuf, root_cert_file: PathBuf) -> Self {
        Self {
            cert_chain_file,
            key_file,
            root_cert_file,
        }
    }
}

#[tonic::async_trait]
impl PlatformClient for OnPremClient {
    async fn get_dial_options(&self) -> Result<DialOptions> {
        let cert_chain = fs::read(&self.cert_chain_file)
            .await
            .map_err(|e| anyhow!("Cannot load key pair: {e}"))?;
        let key = fs::read(&self.key_file)
            .await
            .map_err(|e| anyhow!("Cannot load key pair: {e}"))?;
        let root_cert = fs::read(&self.root_cert_file)
            .await
            .map_err(|e| anyhow!("Failed to read CA cert: {e}"))?;

        let tls = ClientTlsConfig::new()
            .identity(Identity::from_pem(cert_chain, key))
            .ca_certificate(Certificate::from_pem(root_cert));
        Ok(DialOptions {
            tls: Some(tls),
            authorization: None,
        })
    }

    async fn is_proper_platform(&self) -> bool {
        // The node identity cert is the defining input of this platform.
        self.cert_chain_file.exists()
    }

    async fn get_service_identity(&self) -> Result<String> {
        let cert_chain = fs::read(&self.cert_chain_file)
            .await
            .with_context(|| format!("Failed to read cert file: {}", self.cert_chain_file.display()))?;
        extract_spiffe_uri(&cert_chain)
    }

    async fn get_agent_credential(&self) -> Result<Vec<u8>> {
        fs::read(&self.cert_chain_file)
            .await
            .with_context(|| format!("Failed to read cert file: {}", self.cert_chain_file.display()))
    }

    fn credential_type(&self) -> &'static str {
        "onprem"
    }
}
