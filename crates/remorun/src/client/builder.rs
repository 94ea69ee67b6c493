//! Fluent configuration for a [`RemoteClient`].

use std::sync::Arc;

use super::RemoteClient;
use crate::transport::Channel;

pub struct ClientBuilder {
    channel: Arc<dyn Channel>,
    context_id: Option<String>,
}

impl ClientBuilder {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel, context_id: None }
    }

    /// Fixes the context id. Defaults to a random 64-bit hex string.
    pub fn context_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    pub fn build(self) -> RemoteClient {
        let context_id = self.context_id.unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
        RemoteClient::new(context_id, self.channel)
    }
}
