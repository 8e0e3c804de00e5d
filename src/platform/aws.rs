use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig};

use super::{DialOptions, PlatformClient};

/// The EC2 instance metadata endpoint for the identity document.
const INSTANCE_IDENTITY_URL: &str =
    "http://169.254.169.254/latest/dynamic/instance-identity/document";

/// How long to wait for the metadata endpoint when probing for the platform.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The EC2 instance identity document, as served by the metadata endpoint.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceIdentityDocument {
    pub account_id: String,
    pub architecture: String,
    pub availability_zone: String,
    pub image_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub pending_time: String,
    pub private_ip: String,
    pub region: String,
    pub version: String,
}

/// Platform client backed by the EC2 instance identity document.
pub struct AwsClient {
    root_cert_file: PathBuf,
    http: reqwest::Client,
}

impl AwsClient {
    pub fn new(root_cert_file: PathBuf) -> Self {
        Self {
            root_cert_file,
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_identity_document(
        &self,
        timeout: Option<Duration>,
    ) -> Result<InstanceIdentityDocument> {
        let mut request = self.http.get(INSTANCE_IDENTITY_URL);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("Failed to get EC2 instance identity document: {e}"))?
            .error_for_status()
            .map_err(|e| anyhow!("Failed to get EC2 instance identity document: {e}"))?;
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to get EC2 instance identity document: {e}"))?;
        serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse EC2 instance identity document: {e}"))
    }
}

#[tonic::async_trait]
impl PlatformClient for AwsClient {
    async fn get_dial_options(&self) -> Result<DialOptions> {
        let root_cert = fs::read(&self.root_cert_file)
            .await
            .map_err(|e| anyhow!("Failed to read CA cert: {e}"))?;

        let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(root_cert));
        Ok(DialOptions {
            tls: Some(tls),
            authorization: None,
        })
    }

    async fn is_proper_platform(&self) -> bool {
        self.fetch_identity_document(Some(PROBE_TIMEOUT))
            .await
            .is_ok()
    }

    async fn get_service_identity(&self) -> Result<String> {
        // Service identities are not yet derivable from EC2 metadata.
        Ok(String::new())
    }

    async fn get_agent_credential(&self) -> Result<Vec<u8>> {
        let document = self.fetch_identity_document(None).await?;
        serde_json::to_vec(&document)
            .map_err(|e| anyhow!("Failed to marshal identity document: {e}"))
    }

    fn credential_type(&self) -> &'static str {
        "aws"
    }
}
