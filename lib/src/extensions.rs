//! Registry for namespaced extension methods and notifications
//!
//! Extensions are custom JSON-RPC methods whose names start with `_`
//! (`_myapp/action`). The multiplexer routes any unknown `_`-prefixed
//! method here; the aggregated catalog is advertised inside the
//! `initialize` response's `_meta` field, grouped by namespace.

use crate::{AgentError, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Handler for an extension method: params in, result out.
pub type ExtMethodHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handler for an extension notification. Failures are logged and
/// swallowed; notifications are one-way.
pub type ExtNotificationHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Namespaced method/notification registry.
#[derive(Default)]
pub struct ExtensionRegistry {
    methods: RwLock<HashMap<String, ExtMethodHandler>>,
    notifications: RwLock<HashMap<String, ExtNotificationHandler>>,
}

fn validate_extension_name(name: &str) -> Result<()> {
    if !name.starts_with('_') {
        return Err(AgentError::InvalidRequest(format!(
            "Extension names must start with '_', got: {}",
            name
        )));
    }
    Ok(())
}

/// The segment between the leading `_` and the first `/`:
/// `_myapp/action` → `myapp`.
fn namespace_of(name: &str) -> &str {
    let trimmed = name.trim_start_matches('_');
    trimmed.split('/').next().unwrap_or(trimmed)
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable extension method.
    pub fn register_method(&self, name: impl Into<String>, handler: ExtMethodHandler) -> Result<()> {
        let name = name.into();
        validate_extension_name(&name)?;
        self.methods
            .write()
            .expect("extension methods lock poisoned")
            .insert(name.clone(), handler);
        tracing::debug!("Registered extension method: {}", name);
        Ok(())
    }

    /// Register a one-way extension notification.
    pub fn register_notification(
        &self,
        name: impl Into<String>,
        handler: ExtNotificationHandler,
    ) -> Result<()> {
        let name = name.into();
        validate_extension_name(&name)?;
        self.notifications
            .write()
            .expect("extension notifications lock poisoned")
            .insert(name.clone(), handler);
        tracing::debug!("Registered extension notification: {}", name);
        Ok(())
    }

    /// Remove a method; returns whether it existed.
    pub fn unregister_method(&self, name: &str) -> bool {
        self.methods
            .write()
            .expect("extension methods lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Remove a notification; returns whether it existed.
    pub fn unregister_notification(&self, name: &str) -> bool {
        self.notifications
            .write()
            .expect("extension notifications lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Invoke a registered method.
    pub async fn invoke_method(&self, name: &str, params: Value) -> Result<Value> {
        let future = {
            let methods = self.methods.read().expect("extension methods lock poisoned");
            match methods.get(name) {
                Some(handler) => handler(params),
                None => return Err(AgentError::MethodNotFound(name.to_string())),
            }
        };
        future.await
    }

    /// Deliver a notification. Unknown names and handler failures are
    /// logged, never propagated.
    pub async fn deliver_notification(&self, name: &str, params: Value) {
        let future = {
            let notifications = self
                .notifications
                .read()
                .expect("extension notifications lock poisoned");
            match notifications.get(name) {
                Some(handler) => handler(params),
                None => {
                    tracing::warn!("Dropping notification for unknown extension: {}", name);
                    return;
                }
            }
        };
        if let Err(e) = future.await {
            tracing::warn!("Extension notification {} failed: {}", name, e);
        }
    }

    /// Aggregated catalog, grouped by namespace, for `initialize` `_meta`:
    /// `{"myapp": {"methods": [...], "notifications": [...]}}`.
    pub fn capabilities(&self) -> Value {
        let mut namespaces: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();

        for name in self
            .methods
            .read()
            .expect("extension methods lock poisoned")
            .keys()
        {
            namespaces
                .entry(namespace_of(name).to_string())
                .or_default()
                .0
                .push(name.clone());
        }
        for name in self
            .notifications
            .read()
            .expect("extension notifications lock poisoned")
            .keys()
        {
            namespaces
                .entry(namespace_of(name).to_string())
                .or_default()
                .1
                .push(name.clone());
        }

        let mut catalog = serde_json::Map::new();
        for (namespace, (mut methods, mut notifications)) in namespaces {
            methods.sort();
            notifications.sort();
            catalog.insert(
                namespace,
                serde_json::json!({
                    "methods": methods,
                    "notifications": notifications,
                }),
            );
        }
        Value::Object(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn echo_method() -> ExtMethodHandler {
        Box::new(|params| async move { Ok(json!({"echo": params})) }.boxed())
    }

    #[test]
    fn test_name_guard() {
        let registry = ExtensionRegistry::new();
        let err = registry
            .register_method("myapp/action", echo_method())
            .unwrap_err();
        assert!(err.to_string().contains("must start with '_'"));

        assert!(registry
            .register_method("_myapp/action", echo_method())
            .is_ok());
    }

    #[tokio::test]
    async fn test_register_invoke_unregister() {
        let registry = ExtensionRegistry::new();
        registry
            .register_method("_app/foo", echo_method())
            .unwrap();

        let result = registry
            .invoke_method("_app/foo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["echo"]["x"], 1);

        assert!(registry.unregister_method("_app/foo"));
        assert!(!registry.unregister_method("_app/foo"));

        let err = registry
            .invoke_method("_app/foo", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn test_failing_notification_is_swallowed() {
        let registry = ExtensionRegistry::new();
        registry
            .register_notification(
                "_app/ping",
                Box::new(|_| {
                    async { Err(AgentError::Protocol("handler blew up".to_string())) }.boxed()
                }),
            )
            .unwrap();

        // Must not panic or propagate.
        registry.deliver_notification("_app/ping", json!({})).await;
        registry.deliver_notification("_app/unknown", json!({})).await;
    }

    #[test]
    fn test_capabilities_grouping() {
        let registry = ExtensionRegistry::new();
        registry
            .register_method("_myapp/action", echo_method())
            .unwrap();
        registry
            .register_method("_myapp/other", echo_method())
            .unwrap();
        registry
            .register_notification(
                "_myapp/event",
                Box::new(|_| async { Ok(()) }.boxed()),
            )
            .unwrap();
        registry
            .register_method("_second/thing", echo_method())
            .unwrap();

        let caps = registry.capabilities();
        assert_eq!(
            caps["myapp"]["methods"],
            json!(["_myapp/action", "_myapp/other"])
        );
        assert_eq!(caps["myapp"]["notifications"], json!(["_myapp/event"]));
        assert_eq!(caps["second"]["methods"], json!(["_second/thing"]));
        assert_eq!(caps["second"]["notifications"], json!([]));
    }

    #[test]
    fn test_namespace_extraction() {
        assert_eq!(namespace_of("_myapp/action"), "myapp");
        assert_eq!(namespace_of("_bare"), "bare");
        assert_eq!(namespace_of("_a/b/c"), "a");
    }
}
