pub mod cli;
pub mod config;
pub mod digest;
pub mod oci;
pub mod serve;
pub mod store;
