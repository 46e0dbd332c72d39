pub use addax::remote::v1::{
    self as remote,
    cas_service_client::CasServiceClient,
    cas_service_server::{CasService, CasServiceServer},
    cas_status::ErrorCode,
    execution_cache_service_client::ExecutionCacheServiceClient,
    execution_cache_service_server::{ExecutionCacheService, ExecutionCacheServiceServer},
};

mod addax {
    pub mod remote {
        pub mod v1 {
            tonic::include_proto!("addax.remote.v1");
        }
    }
}
