//! Service lookup
//!
//! The relay does not own service definitions. It asks a [`ServiceLookup`] for
//! the token and public port of a service name at handshake time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A service an agent may expose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    #[serde(rename = "name")]
    pub service_name: String,
    #[serde(rename = "token")]
    pub service_token: String,
    /// Public port on the relay; 0 picks an ephemeral port
    #[serde(rename = "port")]
    pub service_port: u16,
}

impl ServiceOptions {
    pub fn new(name: impl Into<String>, token: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: name.into(),
            service_token: token.into(),
            service_port: port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service lookup failed: {0}")]
    Backend(String),
}

/// Maps a service name to its options
pub trait ServiceLookup: Send + Sync + 'static {
    fn service_options(&self, service_name: &str) -> Result<ServiceOptions, LookupError>;
}

impl<F> ServiceLookup for F
where
    F: Fn(&str) -> Result<ServiceOptions, LookupError> + Send + Sync + 'static,
{
    fn service_options(&self, service_name: &str) -> Result<ServiceOptions, LookupError> {
        self(service_name)
    }
}

/// Fixed set of services, typically loaded from a config file
#[derive(Debug, Clone, Default)]
pub struct StaticServices {
    services: HashMap<String, ServiceOptions>,
}

impl StaticServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, options: ServiceOptions) -> Self {
        self.insert(options);
        self
    }

    /// Add a service, replacing any previous one with the same name
    pub fn insert(&mut self, options: ServiceOptions) -> Option<ServiceOptions> {
        self.services.insert(options.service_name.clone(), options)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl FromIterator<ServiceOptions> for StaticServices {
    fn from_iter<I: IntoIterator<Item = ServiceOptions>>(iter: I) -> Self {
        let mut services = StaticServices::new();
        for options in iter {
            services.insert(options);
        }
        services
    }
}

impl ServiceLookup for StaticServices {
    fn service_options(&self, service_name: &str) -> Result<ServiceOptions, LookupError> {
        self.services
            .get(service_name)
            .cloned()
            .ok_or_else(|| LookupError::UnknownService(service_name.to_string()))
    }
}
