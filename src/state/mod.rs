pub mod abort;
pub mod model_manager;
pub mod request_registry;
pub mod sessions;
pub mod shutdown;
