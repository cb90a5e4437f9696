use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{Client, Config, Result};

/// One shared [`Client`] per deployment key.
///
/// Owned by the caller, so different parts of an application can share clients without a
/// process-wide global.
///
/// ```
/// # use experiment_local::{ClientRegistry, Config};
/// let registry = ClientRegistry::new();
/// let client = registry.initialize("deployment-key", Config::new()).unwrap();
/// let same = registry.initialize("deployment-key", Config::new()).unwrap();
/// assert!(std::sync::Arc::ptr_eq(&client, &same));
/// ```
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    /// The client for `api_key`, created with `config` if there is none yet. `config` is ignored
    /// for existing clients.
    ///
    /// The client is not started.
    pub fn initialize(&self, api_key: &str, config: Config) -> Result<Arc<Client>> {
        let mut clients = self
            .clients
            .lock()
            .expect("thread holding client registry lock should not panic");
        if let Some(client) = clients.get(api_key) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(Client::new(api_key, config)?);
        clients.insert(api_key.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    pub fn get(&self, api_key: &str) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .expect("thread holding client registry lock should not panic")
            .get(api_key)
            .cloned()
    }

    /// Forget the client for `api_key`. It keeps running while other handles exist.
    pub fn remove(&self, api_key: &str) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .expect("thread holding client registry lock should not panic")
            .remove(api_key)
    }
}
