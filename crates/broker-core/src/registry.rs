//! Process-wide `locator -> Terminal` mapping.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::terminal::Terminal;

/// Concurrency-safe insert/lookup/remove of Terminals by locator.
///
/// Not a global singleton: a broker owns one Registry instance and passes it
/// around explicitly, so tests can create independent instances.
#[derive(Default)]
pub struct Registry {
    terminals: RwLock<HashMap<String, Arc<Terminal>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `DuplicateLocator` if the locator is already registered.
    pub async fn register(&self, terminal: Arc<Terminal>) -> Result<()> {
        let mut terminals = self.terminals.write().await;
        if terminals.contains_key(terminal.locator()) {
            return Err(Error::DuplicateLocator(terminal.locator().to_string()));
        }
        terminals.insert(terminal.locator().to_string(), terminal);
        Ok(())
    }

    pub async fn find(&self, locator: &str) -> Option<Arc<Terminal>> {
        self.terminals.read().await.get(locator).cloned()
    }

    /// Idempotent.
    pub async fn unregister(&self, locator: &str) {
        self.terminals.write().await.remove(locator);
    }

    pub async fn len(&self) -> usize {
        self.terminals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.terminals.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn terminal(locator: &str) -> Arc<Terminal> {
        Arc::new(Terminal::new(&CancellationToken::new(), locator.into(), "secret".into()))
    }

    #[tokio::test]
    async fn register_rejects_duplicate_locator() {
        let registry = Registry::new();
        registry.register(terminal("loc-a")).await.unwrap();

        let err = registry.register(terminal("loc-a")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateLocator(_)));
    }

    #[tokio::test]
    async fn find_returns_registered_terminal_until_unregistered() {
        let registry = Registry::new();
        registry.register(terminal("loc-b")).await.unwrap();

        assert!(registry.find("loc-b").await.is_some());
        registry.unregister("loc-b").await;
        assert!(registry.find("loc-b").await.is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Registry::new();
        registry.unregister("missing").await;
        registry.unregister("missing").await;
    }

    #[tokio::test]
    async fn find_of_unknown_locator_is_none() {
        let registry = Registry::new();
        assert!(registry.find("ghost").await.is_none());
    }
}
