//! The SDK entry point.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::machine::Machines;
use crate::transport::{Api, HttpTransport, Transport};

/// Entry point holding configuration and the shared transport.
///
/// Cloning is cheap; clones share the same transport.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    api: Api,
}

impl Client {
    /// Create a client configured from `DESKPILOT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the resulting configuration is invalid.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::from_env())
    }

    /// Create a client over HTTP with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a client over a custom transport.
    #[must_use]
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                api: Api::new(transport),
            }),
        }
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Factory for machine handles.
    #[must_use]
    pub fn machines(&self) -> Machines {
        Machines::new(self.clone())
    }

    pub(crate) fn api(&self) -> &Api {
        &self.inner.api
    }

    pub(crate) fn remote_url(&self, path: &str) -> String {
        format!("{}/{}", self.inner.config.remote_url, path)
    }

    pub(crate) fn local_url(&self, path: &str) -> String {
        format!("{}/{}", self.inner.config.local_url, path)
    }

    pub(crate) fn ui_url(&self, path: &str) -> String {
        format!("{}/{}", self.inner.config.ui_url, path)
    }
}
