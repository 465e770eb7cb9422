/*!
 * Port registry for Portwarden.
 *
 * The registry guarantees at most one state machine per port id and
 * broadcasts additions and removals so the security governor can track
 * device changes.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use portwarden_core::error::Error as CoreError;
use portwarden_core::types::Id;

use crate::error::{PortError, Result};
use crate::port::{PortInfo, PortStateMachine, PortStatus};

/// Event types for the port registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A port was registered
    PortAdded(PortInfo),
    /// A port was removed
    PortRemoved(Id),
}

/// Port registry
#[derive(Debug)]
pub struct PortRegistry {
    ports: RwLock<HashMap<Id, Arc<PortStateMachine>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

fn poisoned(kind: &str) -> PortError {
    CoreError::runtime(format!("Failed to acquire {} lock on port registry", kind)).into()
}

impl PortRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            ports: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Register a port; a second state machine for the same id is rejected
    pub fn register(&self, port: PortStateMachine) -> Result<Arc<PortStateMachine>> {
        let id = port.id().clone();
        let info = port.info().clone();

        let mut ports = self.ports.write().map_err(|_| poisoned("write"))?;
        if ports.contains_key(&id) {
            return Err(PortError::AlreadyExists(id.to_string()));
        }

        let port = Arc::new(port);
        ports.insert(id.clone(), port.clone());
        let _ = self.event_sender.send(RegistryEvent::PortAdded(info));
        debug!("Registered port {}", id);

        Ok(port)
    }

    /// Remove a closed port
    pub fn remove(&self, id: &Id) -> Result<()> {
        let mut ports = self.ports.write().map_err(|_| poisoned("write"))?;
        let port = ports
            .get(id)
            .ok_or_else(|| PortError::NotFound(id.to_string()))?;

        let status = port.status()?;
        if status != PortStatus::Closed {
            return Err(PortError::invalid_state("remove", status));
        }

        ports.remove(id);
        let _ = self.event_sender.send(RegistryEvent::PortRemoved(id.clone()));
        debug!("Removed port {}", id);

        Ok(())
    }

    /// Get a port by id
    pub fn get(&self, id: &Id) -> Result<Arc<PortStateMachine>> {
        let ports = self.ports.read().map_err(|_| poisoned("read"))?;
        ports
            .get(id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(id.to_string()))
    }

    /// All registered ports
    pub fn ports(&self) -> Result<Vec<Arc<PortStateMachine>>> {
        let ports = self.ports.read().map_err(|_| poisoned("read"))?;
        Ok(ports.values().cloned().collect())
    }

    /// All registered port ids, sorted
    pub fn ids(&self) -> Result<Vec<Id>> {
        let ports = self.ports.read().map_err(|_| poisoned("read"))?;
        let mut ids: Vec<Id> = ports.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Whether a port is registered
    pub fn contains(&self, id: &Id) -> Result<bool> {
        let ports = self.ports.read().map_err(|_| poisoned("read"))?;
        Ok(ports.contains_key(id))
    }

    /// Number of registered ports
    pub fn count(&self) -> Result<usize> {
        let ports = self.ports.read().map_err(|_| poisoned("read"))?;
        Ok(ports.len())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared port registry that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedPortRegistry(Arc<PortRegistry>);

impl SharedPortRegistry {
    /// Create a new shared port registry
    pub fn new() -> Self {
        Self(Arc::new(PortRegistry::new()))
    }

    /// Get a reference to the port registry
    pub fn registry(&self) -> &PortRegistry {
        &self.0
    }
}

impl AsRef<PortRegistry> for SharedPortRegistry {
    fn as_ref(&self) -> &PortRegistry {
        self.registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PortCapabilities;
    use crate::mock::MockTransport;
    use crate::options::PortOptions;
    use crate::port::PortType;
    use portwarden_core::event::SharedEventBus;

    fn port(id: &str) -> PortStateMachine {
        PortStateMachine::new(
            PortInfo::new(id, format!("/dev/{}", id), PortType::Rs232),
            PortCapabilities::default(),
            Arc::new(MockTransport::new()),
            SharedEventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() -> Result<()> {
        let registry = PortRegistry::new();
        let mut events = registry.subscribe();

        registry.register(port("ttyS0"))?;
        assert!(matches!(
            registry.register(port("ttyS0")),
            Err(PortError::AlreadyExists(_))
        ));
        assert_eq!(registry.count()?, 1);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::PortAdded(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_requires_closed() -> Result<()> {
        let registry = SharedPortRegistry::new();
        let id: Id = "ttyS1".into();
        let handle = registry.registry().register(port("ttyS1"))?;

        handle.open(PortOptions::default()).await?;
        assert!(matches!(
            registry.registry().remove(&id),
            Err(PortError::InvalidState { operation: "remove", .. })
        ));

        handle.close().await?;
        registry.registry().remove(&id)?;
        assert!(!registry.registry().contains(&id)?);
        assert!(matches!(registry.registry().get(&id), Err(PortError::NotFound(_))));
        Ok(())
    }
}
