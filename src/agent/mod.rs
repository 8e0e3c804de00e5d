pub mod workload;

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::NodeAgentConfig;
use crate::grpc::istio_ca::CsrRequest;
use crate::network::CaClient;
use crate::pki::certificate::{gen_csr, CertOptions};
use crate::pki::validator::get_wait_time;
use crate::platform::PlatformClient;
use workload::SecretFile;

/// Interval between certificate requests while the CA keeps failing.
pub const CSR_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Number of retries before the agent gives up on the CA.
pub const CSR_MAX_RETRIES: u32 = 5;

/// Grace period length as a percentage of the whole certificate TTL.
pub const CSR_GRACE_PERIOD_PERCENTAGE: u8 = 50;

/// The backoff interval never grows beyond this multiple of its initial value.
const MAX_BACKOFF_MULTIPLIER: u32 = 10;

/// Requests, renews and surfaces workload certificates on one node.
///
/// The agent is deliberately serial: one CSR in flight at most, so exactly
/// one identity is active on disk at any time.
pub struct NodeAgent {
    config: NodeAgentConfig,
    platform: Box<dyn PlatformClient>,
    ca_client: Box<dyn CaClient>,
    workload: SecretFile,
}

impl NodeAgent {
    pub fn new(
        config: NodeAgentConfig,
        platform: Box<dyn PlatformClient>,
        ca_client: Box<dyn CaClient>,
    ) -> Self {
        let workload = SecretFile::new(
            config.service_cert_file.clone(),
            config.service_key_file.clone(),
        );
        Self {
            config,
            platform,
            ca_client,
            workload,
        }
    }

    /// Run the CSR loop with the configured retry policy.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with_args(
            self.config.csr_retry_interval,
            self.config.csr_max_retries,
            self.config.csr_grace_period_percentage,
        )
        .await
    }

    /// Run the CSR loop: request a certificate, write it out and sleep until
    /// renewal; back off exponentially on failure until the retry budget is
    /// spent.
    pub async fn start_with_args(
        &mut self,
        interval: Duration,
        max_retries: u32,
        grace_period_percentage: u8,
    ) -> Result<()> {
        if !self.platform.is_proper_platform().await {
            let err = anyhow!("node agent is not running on the right platform");
            error!("{err}");
            return Err(err);
        }

        if self.config.service_identity.is_empty() {
            self.config.service_identity = self
                .platform
                .get_service_identity()
                .await
                .context("failed to determine the service identity from the platform")?;
        }

        info!("Node Agent starts successfully.");

        let max_interval = interval * MAX_BACKOFF_MULTIPLIER;
        let mut retries: u32 = 0;
        let mut retrial_interval = interval;
        loop {
            let (private_key_pem, request) = self.create_request().await?;

            let dial_options = self
                .platform
                .get_dial_options()
                .await
                .inspect_err(|e| error!("{e}"))?;

            info!("Sending CSR (retrial #{retries}) ...");
            let result = self
                .ca_client
                .send_csr(&self.config.ca_address, dial_options, request)
                .await;

            let mut success = false;
            if let Ok(response) = &result {
                if response.is_approved {
                    match get_wait_time(
                        &response.signed_cert_chain,
                        OffsetDateTime::now_utc(),
                        grace_period_percentage,
                    ) {
                        Ok(wait_time) => {
                            self.workload
                                .set_service_identity_key(private_key_pem.as_bytes())
                                .map_err(|e| anyhow!("file write error: {e}"))?;
                            self.workload
                                .set_service_identity_cert(&response.signed_cert_chain)
                                .map_err(|e| anyhow!("file write error: {e}"))?;
                            info!(
                                "CSR is approved successfully. Will renew cert in {:?}",
                                wait_time
                            );
                            retries = 0;
                            retrial_interval = interval;
                            sleep(wait_time).await;
                            success = true;
                        }
                        Err(e) => {
                            error!("Error getting TTL from approved cert: {e}");
                        }
                    }
                }
            }

            if !success {
                retries += 1;
                if retries > max_retries {
                    let err = anyhow!(
                        "node agent can't get the CSR approved from Istio CA after max number of retries ({max_retries})"
                    );
                    error!("{err}");
                    return Err(err);
                }
                match &result {
                    Err(e) => {
                        error!("CSR signing failed: {e}. Will retry in {retrial_interval:?}")
                    }
                    Ok(response) if !response.is_approved => {
                        error!("CSR signing failed: request not approved. Will retry in {retrial_interval:?}")
                    }
                    Ok(_) => {
                        error!("Certificate parsing error. Will retry in {retrial_interval:?}")
                    }
                }
                sleep(retrial_interval).await;
                // Exponential backoff, bounded.
                retrial_interval = (retrial_interval * 2).min(max_interval);
            }
        }
    }

    /// Build a CSR for the configured identity along with the attestation
    /// payload the CA validates it against.
    async fn create_request(&self) -> Result<(String, CsrRequest)> {
        let options = CertOptions {
            host: self.config.service_identity.clone(),
            org: self.config.service_identity_org.clone(),
            rsa_key_size: self.config.rsa_key_size,
            ..Default::default()
        };
        let (csr_pem, private_key_pem) =
            gen_csr(&options).context("failed to generate CSR")?;
        let credential = self.platform.get_agent_credential().await?;

        Ok((
            private_key_pem,
            CsrRequest {
                csr_pem: csr_pem.into_bytes(),
                node_agent_credential: credential,
                credential_type: self.platform.credential_type().to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::istio_ca::{CsrResponse, CsrStatus};
    use crate::pki::certificate::gen_cert;
    use crate::platform::DialOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakePlatformClient {
        proper: bool,
    }

    #[tonic::async_trait]
    impl PlatformClient for FakePlatformClient {
        async fn get_dial_options(&self) -> Result<DialOptions> {
            Ok(DialOptions::default())
        }
        async fn is_proper_platform(&self) -> bool {
            self.proper
        }
        async fn get_service_identity(&self) -> Result<String> {
            Ok("spiffe://cluster.local/ns/default/sa/default".to_string())
        }
        async fn get_agent_credential(&self) -> Result<Vec<u8>> {
            Ok(b"fake credential".to_vec())
        }
        fn credential_type(&self) -> &'static str {
            "onprem"
        }
    }

    struct FakeCaClient {
        counter: Arc<AtomicUsize>,
        response: Option<CsrResponse>,
    }

    #[tonic::async_trait]
    impl CaClient for FakeCaClient {
        async fn send_csr(
            &self,
            _address: &str,
            _options: DialOptions,
            _request: CsrRequest,
        ) -> Result<CsrResponse> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Some(response) => Ok(response.clone()),
                None => Err(anyhow!("CA is unavailable")),
            }
        }
    }

    fn test_agent(response: Option<CsrResponse>, proper: bool) -> (NodeAgent, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().unwrap();
        let config = NodeAgentConfig {
            service_identity: "spiffe://cluster.local/ns/default/sa/default".to_string(),
            service_identity_org: "test.org".to_string(),
            service_cert_file: dir.path().join("serviceIdentityCert.pem"),
            service_key_file: dir.path().join("serviceIdentityKey.pem"),
            ..Default::default()
        };
        let agent = NodeAgent::new(
            config,
            Box::new(FakePlatformClient { proper }),
            Box::new(FakeCaClient {
                counter: Arc::clone(&counter),
                response,
            }),
        );
        (agent, counter)
    }

    fn not_approved() -> CsrResponse {
        CsrResponse {
            is_approved: false,
            status: Some(CsrStatus {
                code: tonic::Code::Internal as i32,
                message: "request not approved".to_string(),
            }),
            signed_cert_chain: Vec::new(),
        }
    }

    fn approved_with_expired_cert() -> CsrResponse {
        let not_before = time::macros::datetime!(2017-08-23 19:00:40 UTC);
        let not_after = time::macros::datetime!(2017-08-24 19:00:40 UTC);
        let (cert_pem, _) = gen_cert(&CertOptions {
            host: "spiffe://cluster.local/ns/default/sa/default".to_string(),
            not_before,
            not_after,
            org: "test.org".to_string(),
            is_self_signed: true,
            rsa_key_size: 1024,
            ..Default::default()
        })
        .unwrap();
        CsrResponse {
            is_approved: true,
            status: None,
            signed_cert_chain: cert_pem.into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_wrong_platform_aborts() {
        let (mut agent, counter) = test_agent(None, false);
        let err = agent
            .start_with_args(Duration::from_millis(1), 3, 50)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "node agent is not running on the right platform"
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_on_send_errors() {
        let (mut agent, counter) = test_agent(None, true);
        let err = agent
            .start_with_args(Duration::from_millis(1), 3, 50)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "node agent can't get the CSR approved from Istio CA after max number of retries (3)"
        );
        // One initial attempt plus the full retry budget.
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_on_rejection() {
        let (mut agent, counter) = test_agent(Some(not_approved()), true);
        let err = agent
            .start_with_args(Duration::from_millis(1), 2, 50)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "node agent can't get the CSR approved from Istio CA after max number of retries (2)"
        );
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_approved_but_expired_cert_retries() {
        let (mut agent, counter) = test_agent(Some(approved_with_expired_cert()), true);
        let err = agent
            .start_with_args(Duration::from_millis(1), 1, 50)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "node agent can't get the CSR approved from Istio CA after max number of retries (1)"
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_progression_is_capped() {
        let initial = Duration::from_millis(10);
        let max_interval = initial * MAX_BACKOFF_MULTIPLIER;
        let mut interval = initial;
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(interval);
            interval = (interval * 2).min(max_interval);
        }
        assert_eq!(
            observed,
            vec![
                initial,
                initial * 2,
                initial * 4,
                initial * 8,
                max_interval,
                max_interval,
            ]
        );
    }
}
