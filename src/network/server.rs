use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::info;

use crate::grpc::istio_ca::istio_ca_service_server::IstioCaServiceServer;
use crate::grpc::IstioCaServiceImpl;
use crate::pki::ca::IstioCa;

/// gRPC server exposing the certificate authority.
pub struct CaServer {
    listen_address: SocketAddr,
    tls_identity: Option<(Vec<u8>, Vec<u8>)>,
    service: IstioCaServiceImpl,
}

impl CaServer {
    /// Create a new CA server. When a PEM cert/key pair is given the server
    /// terminates TLS with it, otherwise it serves in the clear.
    pub fn new(
        listen_address: SocketAddr,
        ca: Arc<IstioCa>,
        tls_identity: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Self {
        Self {
            listen_address,
            tls_identity,
            service: IstioCaServiceImpl::new(ca),
        }
    }

    /// Start serving CSR requests.
    pub async fn start(self) -> Result<()> {
        info!("Starting Istio CA gRPC server on {}", self.listen_address);

        let mut builder = Server::builder();
        if let Some((cert, key)) = self.tls_identity {
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                .context("invalid server TLS configuration")?;
        }

        builder
            .add_service(IstioCaServiceServer::new(self.service))
            .serve(self.listen_address)
            .await
            .context("Server error")?;

        Ok(())
    }
}
