use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig};

use super::{DialOptions, PlatformClient};

/// The GCE metadata service.
const METADATA_SERVER_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// How long to wait for the metadata service when probing for the platform.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Platform client backed by the GCE instance identity.
///
/// The CA verifies a VM identity JWT whose audience both ends agree on, so
/// the audience is derived from the CA address at construction.
pub struct GcpClient {
    root_cert_file: PathBuf,
    audience: String,
    http: reqwest::Client,
}

impl GcpClient {
    pub fn new(root_cert_file: PathBuf, ca_address: &str) -> Self {
        Self {
            root_cert_file,
            audience: format!("grpc://{ca_address}"),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the VM identity JWT from the metadata service.
    async fn fetch_identity_token(&self) -> Result<String> {
        let url = format!(
            "{METADATA_SERVER_URL}/instance/service-accounts/default/identity?audience={}",
            self.audience
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("Failed to get the instance identity from the GCE metadata service")?
            .error_for_status()
            .context("The GCE metadata service refused the identity request")?;
        response
            .text()
            .await
            .context("Failed to read the instance identity token")
    }

    async fn fetch_metadata(&self, path: &str, timeout: Option<Duration>) -> Result<String> {
        let mut request = self
            .http
            .get(format!("{METADATA_SERVER_URL}/{path}"))
            .header("Metadata-Flavor", "Google");
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to query the GCE metadata service for {path}"))?
            .error_for_status()
            .with_context(|| format!("The GCE metadata service refused the query for {path}"))?;
        response.text().await.context("Failed to read the metadata response")
    }
}

#[tonic::async_trait]
impl PlatformClient for GcpClient {
    async fn get_dial_options(&self) -> Result<DialOptions> {
        let token = self.fetch_identity_token().await?;
        let root_cert = fs::read(&self.root_cert_file)
            .await
            .map_err(|e| anyhow!("Failed to read CA cert: {e}"))?;

        let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(root_cert));
        Ok(DialOptions {
            tls: Some(tls),
            authorization: Some(token),
        })
    }

    async fn is_proper_platform(&self) -> bool {
        self.fetch_metadata("instance/id", Some(PROBE_TIMEOUT))
            .await
            .is_ok()
    }

    async fn get_service_identity(&self) -> Result<String> {
        self.fetch_metadata("instance/service-accounts/default/email", None)
            .await
    }

    async fn get_agent_credential(&self) -> Result<Vec<u8>> {
        Ok(self.fetch_identity_token().await?.into_bytes())
    }

    fn credential_type(&self) -> &'static str {
        "gcp"
    }
}
