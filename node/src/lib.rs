use serde::Deserialize;
use tonic::transport::Server;

mod services;

use protos::*;
use services::*;

pub use services::ServiceOptions;

#[derive(Debug, Clone, Copy, Deserialize)]
pub enum StorageBackend {
    #[serde(alias = "memory")]
    InMemory,
}

/// The `[node]` table of the node configuration file.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub address: std::net::SocketAddr,
    pub storage_backend: StorageBackend,
    #[serde(default)]
    pub service: ServiceOptions,
}

pub enum Connection {
    // Default gRPC over TCP
    Tcp(std::net::SocketAddr),
    // Unix Domain Socket. Used for testing.
    Uds(tokio_stream::wrappers::UnixListenerStream),
}

pub async fn start_addax(
    conn: Connection,
    storage_backend: StorageBackend,
    options: ServiceOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let cas = match storage_backend {
        StorageBackend::InMemory => cas::InMemory::default(),
    };
    serve(cas, conn, options).await
}

/// Serve the cache protocol on `conn`, backed by `cas`.
pub async fn serve<C: cas::ContentAddressableStorage>(
    cas: C,
    conn: Connection,
    options: ServiceOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(?options, "starting addax node");
    let server = Server::builder()
        .trace_fn(|event| tracing::info_span!("gRPC Request", api = event.uri().path()))
        .add_service(CasServiceServer::new(ContentStorageService::new(
            cas.clone(),
            options,
        )))
        .add_service(ExecutionCacheServiceServer::new(ActionCacheService::new(
            cas,
        )));

    match conn {
        Connection::Tcp(address) => {
            server.serve(address).await?;
        }
        Connection::Uds(uds_stream) => {
            server.serve_with_incoming(uds_stream).await?;
        }
    }
    Ok(())
}
