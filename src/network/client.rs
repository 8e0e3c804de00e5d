use anyhow::{anyhow, bail, Result};
use tonic::metadata::MetadataValue;
use tonic::transport::Endpoint;
use tracing::debug;

use crate::grpc::istio_ca::istio_ca_service_client::IstioCaServiceClient;
use crate::grpc::istio_ca::{CsrRequest, CsrResponse};
use crate::platform::DialOptions;

/// Client for sending certificate signing requests to the CA.
#[tonic::async_trait]
pub trait CaClient: Send + Sync {
    /// Send one CSR to the CA and return its response or an error.
    async fn send_csr(
        &self,
        address: &str,
        options: DialOptions,
        request: CsrRequest,
    ) -> Result<CsrResponse>;
}

/// gRPC implementation of the CSR client. A fresh connection is opened per
/// request and dropped on every exit path.
pub struct CaGrpcClient;

#[tonic::async_trait]
impl CaClient for CaGrpcClient {
    async fn send_csr(
        &self,
        address: &str,
        options: DialOptions,
        request: CsrRequest,
    ) -> Result<CsrResponse> {
        if address.is_empty() {
            bail!("Istio CA address is empty");
        }
        if options.authorization.is_some() && options.tls.is_none() {
            bail!("per-RPC credentials require transport security");
        }

        let scheme = if options.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|e| anyhow!("Failed to dial {address}: {e}"))?;
        if let Some(tls) = options.tls {
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| anyhow!("Failed to dial {address}: {e}"))?;
        }

        debug!("Dialing Istio CA at {address}");
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| anyhow!("Failed to dial {address}: {e}"))?;
        let mut client = IstioCaServiceClient::new(channel);

        let mut req = tonic::Request::new(request);
        if let Some(token) = &options.authorization {
            let value = MetadataValue::try_from(token.as_str())
                .map_err(|_| anyhow!("invalid authorization token"))?;
            req.metadata_mut().insert("authorization", value);
        }

        let response = client
            .handle_csr(req)
            .await
            .map_err(|e| anyhow!("CSR request failed {e}"))?;
        Ok(response.into_inner())
    }
}
