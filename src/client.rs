//! Manager lookup and multiplexing.
//!
//! [`Client::socket`] resolves a full URI such as
//! `https://example.com/chat?token=abc` into a namespace [`Socket`],
//! sharing one [`Manager`] per origin:
//!
//! | Condition | Manager |
//! |-----------|---------|
//! | `force_new` set | new, not cached |
//! | `multiplex` unset | new, not cached |
//! | namespace already on the cached manager | new, not cached |
//! | otherwise | cached per `scheme://host:port` |
//!
//! # Example
//!
//! ```ignore
//! use sockio::{Client, ManagerOptions};
//!
//! let client = Client::new();
//! let chat = client.socket("http://localhost:3000/chat", ManagerOptions::new())?;
//! let news = client.socket("http://localhost:3000/news", ManagerOptions::new())?;
//! // both namespaces share one engine session
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::manager::{Manager, ManagerOptions};
use crate::socket::Socket;
use crate::transport::{DefaultTransportFactory, TransportFactory};

// ============================================================================
// Client
// ============================================================================

/// Cache of managers keyed by origin.
pub struct Client {
    managers: Mutex<FxHashMap<String, Manager>>,
    factory: Arc<dyn TransportFactory>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates an empty cache using the built-in transports.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory::new()))
    }

    /// Creates an empty cache whose managers use `factory`.
    #[must_use]
    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            managers: Mutex::new(FxHashMap::default()),
            factory,
        }
    }

    /// Returns the socket for the namespace in `uri`'s path.
    ///
    /// The URI query is attached both to the engine request and to the
    /// namespace `Connect` packet. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] for an unparsable URI and [`Error::Config`]
    /// for invalid options.
    pub fn socket(&self, uri: &str, options: ManagerOptions) -> Result<Socket> {
        let parsed = Url::parse(uri)?;
        let key = cache_key(&parsed)?;
        let namespace = parsed.path().to_string();
        let query = parsed.query().filter(|q| !q.is_empty()).map(str::to_string);

        let manager = {
            let mut managers = self.managers.lock();
            let same_namespace = managers
                .get(&key)
                .is_some_and(|manager| manager.has_namespace(&namespace));

            if options.force_new || !options.multiplex || same_namespace {
                debug!(%key, %namespace, "Creating dedicated manager");
                Manager::with_factory(uri, options, Arc::clone(&self.factory))?
            } else if let Some(manager) = managers.get(&key) {
                manager.clone()
            } else {
                debug!(%key, "Caching manager");
                let manager = Manager::with_factory(uri, options, Arc::clone(&self.factory))?;
                managers.insert(key, manager.clone());
                manager
            }
        };

        Ok(match query {
            Some(query) => manager.socket_with_query(&namespace, query),
            None => manager.socket(&namespace),
        })
    }

    /// Returns the cached manager for `uri`'s origin.
    #[must_use]
    pub fn manager(&self, uri: &str) -> Option<Manager> {
        let key = Url::parse(uri).ok().and_then(|url| cache_key(&url).ok())?;
        self.managers.lock().get(&key).cloned()
    }

    /// Returns the number of cached managers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    /// Returns `true` if no manager is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.lock().is_empty()
    }

    /// Disconnects and forgets every cached manager.
    pub fn clear(&self) {
        for (_, manager) in self.managers.lock().drain() {
            manager.disconnect();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("managers", &self.managers.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Global Cache
// ============================================================================

static GLOBAL: LazyLock<Client> = LazyLock::new(Client::new);

/// Looks up a socket through the process-wide [`Client`].
///
/// # Errors
///
/// Same as [`Client::socket`].
pub fn connect(uri: &str, options: ManagerOptions) -> Result<Socket> {
    GLOBAL.socket(uri, options)
}

// ============================================================================
// Helpers
// ============================================================================

/// `scheme://host:port`, with the scheme's default port filled in.
fn cache_key(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("URI '{url}' has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::config(format!("URI '{url}' has no port")))?;
    Ok(format!("{}://{host}:{port}", url.scheme()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::mock::MockFactory;

    fn client() -> Client {
        let (factory, _created) = MockFactory::new();
        Client::with_factory(factory)
    }

    fn options() -> ManagerOptions {
        ManagerOptions::new().with_auto_connect(false)
    }

    #[test]
    fn test_cache_key_fills_default_port() -> anyhow::Result<()> {
        let key = cache_key(&Url::parse("http://example.com/chat")?)?;
        assert_eq!(key, "http://example.com:80");
        let key = cache_key(&Url::parse("wss://example.com:8443/")?)?;
        assert_eq!(key, "wss://example.com:8443");
        Ok(())
    }

    #[tokio::test]
    async fn test_namespaces_share_manager() -> anyhow::Result<()> {
        let client = client();
        let chat = client.socket("http://localhost/chat", options())?;
        let news = client.socket("http://localhost:80/news", options())?;
        assert_eq!(chat.namespace(), "/chat");
        assert_eq!(news.namespace(), "/news");
        assert_eq!(client.len(), 1);

        let manager = client.manager("http://localhost").expect("cached");
        assert!(manager.has_namespace("/chat"));
        assert!(manager.has_namespace("/news"));
        Ok(())
    }

    #[tokio::test]
    async fn test_same_namespace_gets_new_manager() {
        let client = client();
        let _first = client.socket("http://localhost:3000/chat", options()).expect("socket");
        let _second = client.socket("http://localhost:3000/chat", options()).expect("socket");
        assert_eq!(client.len(), 1);
    }

    #[tokio::test]
    async fn test_force_new_and_no_multiplex_bypass_cache() {
        let client = client();
        let _a = client
            .socket("http://localhost:3000/", options().with_force_new(true))
            .expect("socket");
        let _b = client
            .socket("http://localhost:3000/", options().with_multiplex(false))
            .expect("socket");
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_origins_are_distinct() {
        let client = client();
        let _a = client.socket("http://localhost:3000/", options()).expect("socket");
        let _b = client.socket("http://localhost:4000/", options()).expect("socket");
        let _c = client.socket("https://localhost:3000/", options()).expect("socket");
        assert_eq!(client.len(), 3);

        client.clear();
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_root_path_is_root_namespace() {
        let client = client();
        let socket = client.socket("http://localhost:3000", options()).expect("socket");
        assert_eq!(socket.namespace(), "/");
    }

    #[test]
    fn test_invalid_uri() {
        let client = client();
        assert!(matches!(
            client.socket("not a uri", options()),
            Err(Error::Url(_))
        ));
    }
}
