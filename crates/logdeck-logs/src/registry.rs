use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use logdeck_types::{Route, WindowId};

use crate::error::DeliveryError;

/// Role a window was registered with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowRole {
    Primary,
    Secondary,
}

/// Known windows and which of them finished loading.
///
/// Readiness is only ever set by [`WindowRegistry::mark_ready`]; nothing
/// infers it from other state.
#[derive(Debug, Default)]
pub struct WindowRegistry {
    /// Registration order
    order: Vec<WindowId>,
    roles: HashMap<WindowId, WindowRole>,
    primary: Option<WindowId>,
    ready: HashSet<WindowId>,
    next_id: u64,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new window. Only one primary may exist at a time.
    pub fn register(&mut self, role: WindowRole) -> Result<WindowId, DeliveryError> {
        if role == WindowRole::Primary {
            if let Some(existing) = self.primary {
                return Err(DeliveryError::PrimaryExists(existing));
            }
        }

        self.next_id += 1;
        let id = WindowId(self.next_id);
        self.order.push(id);
        self.roles.insert(id, role);
        if role == WindowRole::Primary {
            self.primary = Some(id);
        }
        Ok(id)
    }

    /// Forget a window and its readiness. Returns `false` if unknown.
    pub fn remove(&mut self, id: WindowId) -> bool {
        if self.roles.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|w| *w != id);
        self.ready.remove(&id);
        if self.primary == Some(id) {
            self.primary = None;
        }
        true
    }

    /// Record the load-finished signal. Returns `false` if unknown.
    pub fn mark_ready(&mut self, id: WindowId) -> bool {
        if !self.roles.contains_key(&id) {
            return false;
        }
        self.ready.insert(id);
        true
    }

    pub fn is_ready(&self, id: WindowId) -> bool {
        self.ready.contains(&id)
    }

    pub fn contains(&self, id: WindowId) -> bool {
        self.roles.contains_key(&id)
    }

    pub fn role(&self, id: WindowId) -> Option<WindowRole> {
        self.roles.get(&id).copied()
    }

    pub fn primary(&self) -> Option<WindowId> {
        self.primary
    }

    /// Primary window first, then the others in registration order
    pub fn flush_order(&self) -> Vec<WindowId> {
        self.primary
            .into_iter()
            .chain(self.order.iter().copied().filter(|id| Some(*id) != self.primary))
            .collect()
    }

    /// Windows an entry with `route` should be buffered for
    pub fn targets(&self, route: Route) -> Vec<WindowId> {
        match route {
            Route::Primary => self.primary.into_iter().collect(),
            Route::Window(id) if self.contains(id) => vec![id],
            Route::Window(_) => Vec::new(),
            Route::Broadcast => self.flush_order(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_primary() {
        let mut registry = WindowRegistry::new();
        let primary = registry.register(WindowRole::Primary).unwrap();
        assert!(matches!(
            registry.register(WindowRole::Primary),
            Err(DeliveryError::PrimaryExists(id)) if id == primary
        ));

        registry.remove(primary);
        assert!(registry.register(WindowRole::Primary).is_ok());
    }

    #[test]
    fn test_readiness_only_from_signal() {
        let mut registry = WindowRegistry::new();
        let id = registry.register(WindowRole::Secondary).unwrap();
        assert!(!registry.is_ready(id));

        assert!(registry.mark_ready(id));
        assert!(registry.is_ready(id));

        registry.remove(id);
        assert!(!registry.is_ready(id));
        assert!(!registry.mark_ready(id));
    }

    #[test]
    fn test_flush_order_puts_primary_first() {
        let mut registry = WindowRegistry::new();
        let a = registry.register(WindowRole::Secondary).unwrap();
        let primary = registry.register(WindowRole::Primary).unwrap();
        let b = registry.register(WindowRole::Secondary).unwrap();

        assert_eq!(registry.flush_order(), vec![primary, a, b]);
    }

    #[test]
    fn test_route_targets() {
        let mut registry = WindowRegistry::new();
        assert!(registry.targets(Route::Primary).is_empty());

        let primary = registry.register(WindowRole::Primary).unwrap();
        let other = registry.register(WindowRole::Secondary).unwrap();

        assert_eq!(registry.targets(Route::Primary), vec![primary]);
        assert_eq!(registry.targets(Route::Window(other)), vec![other]);
        assert!(registry.targets(Route::Window(WindowId(99))).is_empty());
        assert_eq!(registry.targets(Route::Broadcast), vec![primary, other]);
    }
}
