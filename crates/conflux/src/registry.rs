//! Topic registry
//!
//! Handlers are declared on a [`TopicRegistry`] during startup composition,
//! then [`TopicRegistry::resolve`] turns it into an immutable
//! [`ResolvedRegistry`]. The runtime only accepts the resolved form, so
//! nothing can be registered once consumption has started.
//!
//! A topic token is either a literal topic name or `#KEY`, which names a
//! configuration key holding the topic name:
//!
//! ```rust
//! use conflux::registry::TopicRegistry;
//! use conflux::offsets::SeekPolicy;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! struct Billing;
//!
//! let mut registry = TopicRegistry::new();
//! registry.add(
//!     "#ORDERS_TOPIC",
//!     |_billing: Arc<Billing>, envelope, _ctx| async move {
//!         println!("order at offset {}", envelope.offset);
//!         Ok(())
//!     },
//!     Arc::new(Billing),
//!     SeekPolicy::Latest,
//! );
//!
//! let config = HashMap::from([("ORDERS_TOPIC".to_string(), "orders.v1".to_string())]);
//! let resolved = registry.resolve(&config).unwrap();
//! assert!(resolved.get("orders.v1").is_some());
//! ```
//!
//! Registering the same topic twice keeps the last registration.

use crate::config::ConfigResolver;
use crate::dispatch::DispatchContext;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::offsets::SeekPolicy;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Marker prefix for configuration-indirected topic names
pub const CONFIG_TOKEN_PREFIX: char = '#';

/// A topic name, literal or looked up from configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicToken {
    Literal(String),
    /// Configuration key whose value is the topic name
    Config(String),
}

impl TopicToken {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.strip_prefix(CONFIG_TOKEN_PREFIX) {
            Some(key) => Self::Config(key.to_string()),
            None => Self::Literal(raw.to_string()),
        }
    }

    /// Literal topic name. Literal tokens resolve to themselves.
    pub fn resolve(&self, resolver: &dyn ConfigResolver) -> Result<String> {
        match self {
            Self::Literal(name) if name.is_empty() => Err(Error::config("empty topic name")),
            Self::Literal(name) => Ok(name.clone()),
            Self::Config(key) if key.is_empty() => {
                Err(Error::config("topic token '#' names no configuration key"))
            }
            Self::Config(key) => resolver
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::config(format!(
                        "topic token '#{}' is not resolvable: configuration key '{}' is missing or empty",
                        key, key
                    ))
                }),
        }
    }
}

impl From<&str> for TopicToken {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for TopicToken {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl fmt::Display for TopicToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(name) => f.write_str(name),
            Self::Config(key) => write!(f, "{}{}", CONFIG_TOKEN_PREFIX, key),
        }
    }
}

/// Future returned by a handler invocation
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Type-erased handler bound to its invocation context
pub trait Handler: Send + Sync {
    fn call(&self, envelope: Envelope, ctx: DispatchContext) -> HandlerFuture;

    /// Type name of the bound context, for logs
    fn context_name(&self) -> &'static str;
}

struct BoundHandler<C, F> {
    context: Arc<C>,
    func: F,
}

impl<C, F, Fut> Handler for BoundHandler<C, F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Envelope, DispatchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, envelope: Envelope, ctx: DispatchContext) -> HandlerFuture {
        Box::pin((self.func)(Arc::clone(&self.context), envelope, ctx))
    }

    fn context_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }
}

/// One registration entry
#[derive(Clone)]
pub struct Registration {
    pub token: TopicToken,
    pub handler: Arc<dyn Handler>,
    pub seek: SeekPolicy,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .field("context", &self.handler.context_name())
            .field("seek", &self.seek)
            .finish()
    }
}

/// Handler declarations collected before startup
#[derive(Debug, Default, Clone)]
pub struct TopicRegistry {
    entries: Vec<Registration>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` with its invocation `context` for a topic token
    pub fn add<C, F, Fut>(
        &mut self,
        topic: impl Into<TopicToken>,
        handler: F,
        context: Arc<C>,
        seek: SeekPolicy,
    ) -> &mut Self
    where
        C: Send + Sync + 'static,
        F: Fn(Arc<C>, Envelope, DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = topic.into();
        debug!(token = %token, seek = %seek, context = std::any::type_name::<C>(), "Registered handler");
        self.entries.push(Registration {
            token,
            handler: Arc::new(BoundHandler {
                context,
                func: handler,
            }),
            seek,
        });
        self
    }

    /// Register a handler that needs no context
    pub fn add_fn<F, Fut>(&mut self, topic: impl Into<TopicToken>, handler: F, seek: SeekPolicy) -> &mut Self
    where
        F: Fn(Envelope, DispatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(
            topic,
            move |_: Arc<()>, envelope, ctx| handler(envelope, ctx),
            Arc::new(()),
            seek,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every token and freeze the registry. Later registrations for
    /// the same resolved topic replace earlier ones.
    pub fn resolve(self, resolver: &dyn ConfigResolver) -> Result<ResolvedRegistry> {
        let mut topics: BTreeMap<String, Registration> = BTreeMap::new();
        for mut entry in self.entries {
            let name = entry.token.resolve(resolver)?;
            if let TopicToken::Config(key) = &entry.token {
                debug!(key = %key, topic = %name, "Resolved topic token");
            }
            entry.token = TopicToken::Literal(name.clone());
            if let Some(previous) = topics.insert(name.clone(), entry) {
                warn!(
                    topic = %name,
                    replaced = previous.handler.context_name(),
                    "Topic registered twice, keeping the last registration"
                );
            }
        }
        Ok(ResolvedRegistry { topics })
    }
}

/// Immutable registry keyed by literal topic name
#[derive(Debug, Default, Clone)]
pub struct ResolvedRegistry {
    topics: BTreeMap<String, Registration>,
}

impl ResolvedRegistry {
    pub fn get(&self, topic: &str) -> Option<&Registration> {
        self.topics.get(topic)
    }

    /// Registered topic names in subscription order
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn seek_policies(&self) -> impl Iterator<Item = (&str, SeekPolicy)> {
        self.topics.iter().map(|(t, r)| (t.as_str(), r.seek))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn noop(registry: &mut TopicRegistry, topic: &str, seek: SeekPolicy) {
        registry.add_fn(topic, |_, _| async { Ok(()) }, seek);
    }

    #[test]
    fn test_token_parse() {
        assert_eq!(TopicToken::parse("orders"), TopicToken::Literal("orders".into()));
        assert_eq!(TopicToken::parse(" #ORDERS "), TopicToken::Config("ORDERS".into()));
        assert_eq!(TopicToken::parse("#ORDERS").to_string(), "#ORDERS");
    }

    #[test]
    fn test_literal_resolve_is_noop() {
        let token = TopicToken::parse("orders");
        let empty = HashMap::new();
        assert_eq!(token.resolve(&empty).unwrap(), "orders");
        let again = TopicToken::parse(&token.resolve(&empty).unwrap());
        assert_eq!(again.resolve(&empty).unwrap(), "orders");
    }

    #[test]
    fn test_resolve_config_token() {
        let mut registry = TopicRegistry::new();
        noop(&mut registry, "#AUDIT_TOPIC", SeekPolicy::Earliest);
        noop(&mut registry, "payments", SeekPolicy::None);

        let resolved = registry
            .resolve(&config(&[("AUDIT_TOPIC", "audit.v2")]))
            .unwrap();
        assert_eq!(resolved.topics().collect::<Vec<_>>(), vec!["audit.v2", "payments"]);
        let entry = resolved.get("audit.v2").unwrap();
        assert_eq!(entry.token, TopicToken::Literal("audit.v2".into()));
        assert_eq!(entry.seek, SeekPolicy::Earliest);
    }

    #[test]
    fn test_missing_config_key_is_configuration_error() {
        let mut registry = TopicRegistry::new();
        noop(&mut registry, "#MISSING", SeekPolicy::None);
        let err = registry.resolve(&HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("MISSING"));

        let mut registry = TopicRegistry::new();
        noop(&mut registry, "#BLANK", SeekPolicy::None);
        assert!(registry.resolve(&config(&[("BLANK", "  ")])).is_err());

        let mut registry = TopicRegistry::new();
        noop(&mut registry, "", SeekPolicy::None);
        assert!(registry.resolve(&HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let mut registry = TopicRegistry::new();
        registry.add(
            "orders",
            |hits: Arc<AtomicU32>, _, _| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            first.clone(),
            SeekPolicy::Earliest,
        );
        registry.add(
            "#ORDERS",
            |hits: Arc<AtomicU32>, _, _| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            second.clone(),
            SeekPolicy::None,
        );
        assert_eq!(registry.len(), 2);

        let resolved = registry.resolve(&config(&[("ORDERS", "orders")])).unwrap();
        assert_eq!(resolved.len(), 1);
        let entry = resolved.get("orders").unwrap();
        assert_eq!(entry.seek, SeekPolicy::None);

        let envelope = Envelope {
            topic: "orders".into(),
            partition: 0,
            offset: 0,
            timestamp: 0,
            key: None,
            value: None,
            headers: Default::default(),
        };
        entry
            .handler
            .call(envelope, DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
