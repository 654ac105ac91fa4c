//! RPC service descriptors.

use std::collections::BTreeMap;

use crate::config::validation::is_valid_name;
use crate::config::ConfigError;

/// Static description of one RPC service: its fully qualified name, the
/// methods it serves and metadata published alongside its registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<String>,
    metadata: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// A descriptor for `name`, e.g. `"calc.v1.Calculator"`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Declare a method. Without any, every method path is routed.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    /// Attach registration metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn metadata_map(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Request path for `method`: `/{name}/{method}`.
    pub fn path(&self, method: &str) -> String {
        format!("/{}/{}", self.name, method)
    }

    /// Check the name and method list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_name(&self.name) {
            return Err(ConfigError::Invalid(format!(
                "invalid rpc service name {:?}",
                self.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for method in &self.methods {
            if method.is_empty() || method.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid method {:?} on {}",
                    method, self.name
                )));
            }
            if !seen.insert(method.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate method {:?} on {}",
                    method, self.name
                )));
            }
        }
        Ok(())
    }
}
