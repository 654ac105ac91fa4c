//! Registration key layout.
//!
//! `{prefix}/{service_name}/{rpc_service_name}/{hostname}-pid-{pid}`

use std::fmt;

use crate::net::addr::hostname;

/// Identity of this process inside a registration key.
pub fn host_identity() -> String {
    format!("{}-pid-{}", hostname(), std::process::id())
}

/// Key prefix under which every instance of one RPC service registers.
pub fn service_prefix(prefix: &str, service_name: &str, rpc_name: &str) -> String {
    format!("{}/{}/{}", prefix, service_name, rpc_name)
}

/// Key this process registers one RPC service under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationKey(String);

impl RegistrationKey {
    pub fn new(prefix: &str, service_name: &str, rpc_name: &str, host_identity: &str) -> Self {
        Self(format!(
            "{}/{}",
            service_prefix(prefix, service_name, rpc_name),
            host_identity
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
