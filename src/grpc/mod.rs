pub mod istio_ca;
pub mod service;

pub use service::IstioCaServiceImpl;
