use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoinvestError, Result};

use super::ExchangeClient;

/// Runtime registry of configured exchange clients.
///
/// Built once at startup; lookups are by the exchange name recorded on
/// allocations and orders. An unknown name is a validation failure for the
/// unit of work that referenced it, never a retryable error.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    pub fn register(&mut self, client: Arc<dyn ExchangeClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get(&self, exchange_name: &str) -> Result<Arc<dyn ExchangeClient>> {
        self.clients
            .get(exchange_name)
            .cloned()
            .ok_or_else(|| CoinvestError::NotFound {
                entity: "exchange",
                id: exchange_name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
