//! Notification handlers and their registry

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{OvsdbError, Result};
use crate::operation::TableUpdates;

/// Observer of server-pushed events.
///
/// Callbacks run on the connection's receive loop and must return quickly.
pub trait NotificationHandler: Send + Sync {
    /// A decoded `update` notification for the monitor `context`
    fn update(&self, _context: &Value, _updates: &TableUpdates) {}

    /// The server sent an `echo` keep-alive
    fn echo(&self) {}

    /// The connection is gone
    fn disconnected(&self) {}
}

/// Token returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handlers in registration order
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn NotificationHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, handler: Arc<dyn NotificationHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);
        id
    }

    pub fn unregister(&self, id: HandlerId) -> Result<()> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|_| ())
            .ok_or(OvsdbError::HandlerNotRegistered(id))
    }

    /// Snapshot taken under the lock so callbacks run without holding it
    pub fn snapshot(&self) -> Vec<Arc<dyn NotificationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl NotificationHandler for Recorder {
        fn echo(&self) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[test]
    fn test_registration_order_and_unregister() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = registry.register(Arc::new(Recorder { name: "a", log: log.clone() }));
        let _b = registry.register(Arc::new(Recorder { name: "b", log: log.clone() }));

        for h in registry.snapshot() {
            h.echo();
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);

        registry.unregister(a).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.unregister(a),
            Err(OvsdbError::HandlerNotRegistered(_))
        ));
    }
}
