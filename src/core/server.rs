//! Core relay server
//!
//! The Server value holds everything sessions share. All of it is read-only
//! once built, except the session registry.

use std::sync::Arc;

use super::connection::ConnectionManager;
use super::credentials::{CredentialSet, EgressPolicy};
use super::dns::DnsResolver;
use crate::config::ConnConfig;

/// Core relay server
pub struct Server {
    /// Accepted UUIDs and Trojan digest
    pub credentials: CredentialSet,
    /// Fallback egress for the single retry
    pub egress: EgressPolicy,
    /// Resolver behind UDP port 53
    pub resolver: Arc<dyn DnsResolver>,
    /// Live session registry
    pub conn_manager: ConnectionManager,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    credentials: Option<CredentialSet>,
    egress: Option<EgressPolicy>,
    resolver: Option<Arc<dyn DnsResolver>>,
    conn_manager: Option<ConnectionManager>,
    conn_config: Option<ConnConfig>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(mut self, credentials: CredentialSet) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn egress(mut self, egress: EgressPolicy) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn conn_manager(mut self, manager: ConnectionManager) -> Self {
        self.conn_manager = Some(manager);
        self
    }

    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server
    ///
    /// Panics if credentials or resolver is not set
    pub fn build(self) -> Server {
        Server {
            credentials: self.credentials.expect("credentials are required"),
            egress: self.egress.unwrap_or_default(),
            resolver: self.resolver.expect("resolver is required"),
            conn_manager: self.conn_manager.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
        }
    }
}
