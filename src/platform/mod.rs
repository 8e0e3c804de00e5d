pub mod aws;
pub mod gcp;
pub mod onprem;

pub use aws::AwsClient;
pub use gcp::GcpClient;
pub use onprem::OnPremClient;

use anyhow::Result;
use tonic::transport::ClientTlsConfig;

use crate::config::{Environment, NodeAgentConfig};

/// Credential material sufficient to dial the CA.
#[derive(Default, Debug)]
pub struct DialOptions {
    /// Transport security for the channel; `None` dials in the clear.
    pub tls: Option<ClientTlsConfig>,

    /// Per-RPC `authorization` metadata value. Only usable over a secured
    /// transport; the CSR client refuses to attach it otherwise.
    pub authorization: Option<String>,
}

/// Client for the platform the node agent runs on. Implementations prove the
/// agent's identity to the CA and produce the credentials needed to reach it.
#[tonic::async_trait]
pub trait PlatformClient: Send + Sync {
    /// Produce dial credentials sufficient to reach the CA.
    async fn get_dial_options(&self) -> Result<DialOptions>;

    /// Whether the node agent is actually running on the declared platform,
    /// e.g. the GCP client should only run on GCE.
    async fn is_proper_platform(&self) -> bool;

    /// The caller's identity as known to the platform.
    async fn get_service_identity(&self) -> Result<String>;

    /// Opaque attestation payload proving the caller's platform identity.
    async fn get_agent_credential(&self) -> Result<Vec<u8>>;

    /// Tag the CA uses to dispatch credential validation.
    fn credential_type(&self) -> &'static str;
}

/// Build the platform client for the environment the agent is configured for.
pub fn new_platform_client(config: &NodeAgentConfig) -> Result<Box<dyn PlatformClient>> {
    match config.env {
        Environment::OnPrem => Ok(Box::new(OnPremClient::new(
            config.cert_chain_file.clone(),
            config.platform_key_file.clone(),
            config.root_cert_file.clone(),
        ))),
        Environment::Gcp => Ok(Box::new(GcpClient::new(
            config.root_cert_file.clone(),
            &config.ca_address,
        ))),
        Environment::Aws => Ok(Box::new(AwsClient::new(config.root_cert_file.clone()))),
    }
}
