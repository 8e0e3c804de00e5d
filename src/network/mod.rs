pub mod client;
pub mod server;

pub use client::{CaClient, CaGrpcClient};
pub use server::CaServer;
