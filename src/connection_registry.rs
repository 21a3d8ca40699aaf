//! Per-connection state: caller identity and open device handles.
//!
//! Disconnect is the one place device handles get closed.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::identity::IdentityCertificate;

pub type ConnectionId = u64;

/// An open serial port, USB/HID claim or similar owned by one connection
pub trait DeviceHandle: Send {
    fn describe(&self) -> String;

    fn close(&mut self) -> Result<()>;
}

pub struct ConnectionState {
    identity: IdentityCertificate,
    devices: HashMap<String, Box<dyn DeviceHandle>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            identity: IdentityCertificate::unknown(),
            devices: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &IdentityCertificate {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: IdentityCertificate) {
        self.identity = identity;
    }

    /// Track `handle` under `key`; a handle already there is handed back
    pub fn add_device(&mut self, key: impl Into<String>, handle: Box<dyn DeviceHandle>) -> Option<Box<dyn DeviceHandle>> {
        self.devices.insert(key.into(), handle)
    }

    pub fn take_device(&mut self, key: &str) -> Option<Box<dyn DeviceHandle>> {
        self.devices.remove(key)
    }

    pub fn has_device(&self, key: &str) -> bool {
        self.devices.contains_key(key)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

pub type SharedConnection = Arc<Mutex<ConnectionState>>;

#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock().insert(id, Arc::new(Mutex::new(ConnectionState::new())));
        debug!("Connection {} registered", id);
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<SharedConnection> {
        self.lock().get(&id).cloned()
    }

    pub fn identity(&self, id: ConnectionId) -> Option<IdentityCertificate> {
        self.get(id)
            .map(|state| state.lock().unwrap_or_else(|e| e.into_inner()).identity().clone())
    }

    /// Returns false when the connection is already gone
    pub fn set_identity(&self, id: ConnectionId, identity: IdentityCertificate) -> bool {
        match self.get(id) {
            Some(state) => {
                state.lock().unwrap_or_else(|e| e.into_inner()).set_identity(identity);
                true
            }
            None => false,
        }
    }

    /// Remove the connection and close every handle it still holds
    ///
    /// A failing handle is logged and the rest are still closed. Returns the
    /// number of handles closed cleanly.
    pub fn disconnect(&self, id: ConnectionId) -> usize {
        let Some(state) = self.lock().remove(&id) else {
            return 0;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let mut closed = 0;
        for (key, mut handle) in state.devices.drain() {
            match handle.close() {
                Ok(()) => closed += 1,
                Err(e) => warn!("Failed to close {} ({}) for connection {}: {:#}", handle.describe(), key, id, e),
            }
        }
        info!("Connection {} closed, released {} device handle(s)", id, closed);
        closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, SharedConnection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    struct FakePort {
        name: &'static str,
        fail: bool,
        closed: Arc<AtomicUsize>,
    }

    impl DeviceHandle for FakePort {
        fn describe(&self) -> String {
            format!("serial port {}", self.name)
        }

        fn close(&mut self) -> Result<()> {
            if self.fail {
                bail!("device busy");
            }
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn port(name: &'static str, fail: bool, closed: &Arc<AtomicUsize>) -> Box<dyn DeviceHandle> {
        Box::new(FakePort {
            name,
            fail,
            closed: closed.clone(),
        })
    }

    #[test]
    fn test_new_connection_is_anonymous() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();
        assert!(registry.identity(id).unwrap().is_unknown());
        assert_ne!(registry.register(), id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_disconnect_closes_remaining_handles_despite_failures() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new();
        let id = registry.register();
        {
            let state = registry.get(id).unwrap();
            let mut state = state.lock().unwrap();
            state.add_device("COM1", port("COM1", false, &closed));
            state.add_device("COM2", port("COM2", true, &closed));
            state.add_device("COM3", port("COM3", false, &closed));
        }

        assert_eq!(registry.disconnect(id), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.disconnect(id), 0);
        assert!(!registry.set_identity(id, IdentityCertificate::unknown()));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = registry.register();
                    registry.disconnect(id);
                    registry.register()
                })
            })
            .collect();
        let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(registry.len(), 8);
    }
}
