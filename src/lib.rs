pub mod blob;
pub mod config;
pub mod domain;
pub mod http;
pub mod id;
pub mod pledge;
pub mod reconcile;
pub mod store;
pub mod version;
