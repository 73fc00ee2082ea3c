//! Test support.

pub mod ssh_client;

pub use ssh_client::SshTestClient;
