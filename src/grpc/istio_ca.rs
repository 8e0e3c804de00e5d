//! Wire types and stubs for the `istio.v1.auth.IstioCAService` gRPC service.
//!
//! The service definition is an external IDL artifact; these modules are
//! checked in, in the shape `tonic-build` emits, so the build does not need
//! a protobuf toolchain.

/// Certificate signing request, together with the credential attesting the
/// caller's platform identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsrRequest {
    /// PEM-encoded PKCS#10 certificate signing request.
    #[prost(bytes = "vec", tag = "1")]
    pub csr_pem: ::prost::alloc::vec::Vec<u8>,
    /// Opaque attestation payload, e.g. a GCE instance identity JWT or an
    /// EC2 instance identity document.
    #[prost(bytes = "vec", tag = "2")]
    pub node_agent_credential: ::prost::alloc::vec::Vec<u8>,
    /// Tag the CA uses to dispatch credential validation: onprem | gcp | aws.
    #[prost(string, tag = "3")]
    pub credential_type: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsrResponse {
    /// Whether the CA accepted the request and signed a certificate.
    #[prost(bool, tag = "1")]
    pub is_approved: bool,
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<CsrStatus>,
    /// PEM-encoded leaf certificate followed by the CA's intermediate chain.
    #[prost(bytes = "vec", tag = "3")]
    pub signed_cert_chain: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CsrStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Generated client implementations.
pub mod istio_ca_service_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    /// Service for signing workload certificates.
    #[derive(Debug, Clone)]
    pub struct IstioCaServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl IstioCaServiceClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> IstioCaServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub async fn handle_csr(
            &mut self,
            request: impl tonic::IntoRequest<super::CsrRequest>,
        ) -> std::result::Result<tonic::Response<super::CsrResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/istio.v1.auth.IstioCAService/HandleCSR");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("istio.v1.auth.IstioCAService", "HandleCSR"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Generated server implementations.
pub mod istio_ca_service_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    /// Generated trait containing gRPC methods that should be implemented
    /// for use with IstioCaServiceServer.
    #[async_trait]
    pub trait IstioCaService: std::marker::Send + std::marker::Sync + 'static {
        async fn handle_csr(
            &self,
            request: tonic::Request<super::CsrRequest>,
        ) -> std::result::Result<tonic::Response<super::CsrResponse>, tonic::Status>;
    }

    /// Service for signing workload certificates.
    #[derive(Debug)]
    pub struct IstioCaServiceServer<T> {
        inner: Arc<T>,
    }

    impl<T> IstioCaServiceServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for IstioCaServiceServer<T>
    where
        T: IstioCaService,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/istio.v1.auth.IstioCAService/HandleCSR" => {
                    #[allow(non_camel_case_types)]
                    struct HandleCSRSvc<T: IstioCaService>(pub Arc<T>);
                    impl<T: IstioCaService> tonic::server::UnaryService<super::CsrRequest>
                        for HandleCSRSvc<T>
                    {
                        type Response = super::CsrResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::CsrRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as IstioCaService>::handle_csr(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    let fut = async move {
                        let method = HandleCSRSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", tonic::Code::Unimplemented as i32)
                        .header(
                            http::header::CONTENT_TYPE,
                            tonic::metadata::GRPC_CONTENT_TYPE,
                        )
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T> Clone for IstioCaServiceServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T> tonic::server::NamedService for IstioCaServiceServer<T> {
        const NAME: &'static str = "istio.v1.auth.IstioCAService";
    }
}
