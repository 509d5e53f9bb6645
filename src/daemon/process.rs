//! Registered process table and its lifecycle state machine

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::Instant,
};

use crate::{
    error::{MonetError, Result},
    layout::{RelativePointer, SegmentId},
};

use super::protocol::PortId;

/// Lifecycle of a registered process as seen by the daemon
///
/// `Registered` becomes `Active` on the first session-bearing request.
/// `Terminating` and `Lost` both funnel into the same reaping path; a
/// reaped process is removed from the table entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Registered,
    Active,
    Terminating,
    Lost,
}

/// One registered application
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
    pub uid: u32,
    /// Monotonic per-registration token; stale tokens are rejected
    pub session_id: u64,
    pub state: ProcessState,
    pub monitored: bool,
    /// Registry-clock milliseconds of the last keep-alive
    pub last_keepalive_ms: u64,
    /// Data segment serving this process's allocations
    pub data_segment: SegmentId,
    /// Management block handed out at registration
    pub management_block: RelativePointer,
    /// Ports owned by this process, kept for cleanup
    pub ports: Vec<PortId>,
}

/// The daemon's process registry
///
/// Process-wide state with a clear lifecycle: initialized before the IPC
/// channel opens, torn down after the channel closes and the worker
/// threads join. Protected by an in-process read-write lock.
#[derive(Debug)]
pub struct ProcessRegistry {
    entries: RwLock<HashMap<String, ProcessEntry>>,
    session_counter: AtomicU64,
    started: Instant,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Milliseconds on the registry's monotonic clock
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Current state of a named process, if registered
    pub fn state_of(&self, name: &str) -> Option<ProcessState> {
        let entries = self.entries.read().unwrap();
        entries.get(name).map(|e| e.state)
    }

    /// Register a new process under a free name
    ///
    /// Session ids are strictly monotonic across all registrations, so a
    /// re-registered name always yields a greater id than its predecessor.
    pub fn register(
        &self,
        name: &str,
        pid: u32,
        uid: u32,
        data_segment: SegmentId,
        management_block: RelativePointer,
    ) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(name) {
            return Err(MonetError::NameTaken {
                name: name.to_string(),
            });
        }

        let session_id = self.session_counter.fetch_add(1, Ordering::AcqRel) + 1;
        entries.insert(
            name.to_string(),
            ProcessEntry {
                name: name.to_string(),
                pid,
                uid,
                session_id,
                state: ProcessState::Registered,
                monitored: true,
                last_keepalive_ms: self.now_ms(),
                data_segment,
                management_block,
                ports: Vec::new(),
            },
        );
        Ok(session_id)
    }

    /// Resolve a session id to its process, rejecting stale tokens
    ///
    /// A valid session also counts as proof of life: the keep-alive
    /// timestamp advances and a `Registered` process becomes `Active`.
    pub fn validate_session(&self, session: u64) -> Result<ProcessEntry> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .values_mut()
            .find(|e| e.session_id == session)
            .ok_or(MonetError::StaleSession {
                got: session,
                current: self.session_counter.load(Ordering::Acquire),
            })?;
        if entry.state == ProcessState::Lost || entry.state == ProcessState::Terminating {
            return Err(MonetError::StaleSession {
                got: session,
                current: self.session_counter.load(Ordering::Acquire),
            });
        }

        entry.last_keepalive_ms = self.started.elapsed().as_millis() as u64;
        if entry.state == ProcessState::Registered {
            entry.state = ProcessState::Active;
        }
        Ok(entry.clone())
    }

    /// Point a freshly registered process at its management block
    pub fn set_management_block(&self, name: &str, block: RelativePointer) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(name).ok_or_else(|| MonetError::UnknownProcess {
            name: name.to_string(),
        })?;
        entry.management_block = block;
        Ok(())
    }

    /// Record a port as owned by a process
    pub fn add_port(&self, name: &str, port: PortId) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(name).ok_or_else(|| MonetError::UnknownProcess {
            name: name.to_string(),
        })?;
        entry.ports.push(port);
        Ok(())
    }

    /// Forget a port after it was destroyed
    pub fn remove_port(&self, name: &str, port: PortId) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(name).ok_or_else(|| MonetError::UnknownProcess {
            name: name.to_string(),
        })?;
        entry.ports.retain(|p| *p != port);
        Ok(())
    }

    /// Number of ports currently owned by a process
    pub fn port_count(&self, name: &str) -> usize {
        let entries = self.entries.read().unwrap();
        entries.get(name).map(|e| e.ports.len()).unwrap_or(0)
    }

    /// Move a process into a new lifecycle state
    pub fn set_state(&self, name: &str, state: ProcessState) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(name).ok_or_else(|| MonetError::UnknownProcess {
            name: name.to_string(),
        })?;
        entry.state = state;
        Ok(())
    }

    /// Names of monitored processes whose keep-alive is older than
    /// `threshold_ms`
    pub fn expired(&self, threshold_ms: u64) -> Vec<String> {
        let now = self.now_ms();
        let entries = self.entries.read().unwrap();
        entries
            .values()
            .filter(|e| {
                e.monitored
                    && matches!(e.state, ProcessState::Registered | ProcessState::Active)
                    && now.saturating_sub(e.last_keepalive_ms) > threshold_ms
            })
            .map(|e| e.name.clone())
            .collect()
    }

    /// Remove a reaped process from the table, returning its entry
    pub fn remove(&self, name: &str) -> Option<ProcessEntry> {
        let mut entries = self.entries.write().unwrap();
        entries.remove(name)
    }

    /// Entry snapshot by name
    pub fn get(&self, name: &str) -> Option<ProcessEntry> {
        let entries = self.entries.read().unwrap();
        entries.get(name).cloned()
    }

    /// Snapshot of every registered process
    pub fn snapshot(&self) -> Vec<ProcessEntry> {
        let entries = self.entries.read().unwrap();
        entries.values().cloned().collect()
    }

    /// Names of all registered processes
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        entries.keys().cloned().collect()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgmt_ptr() -> RelativePointer {
        RelativePointer::new(1, 4096)
    }

    #[test]
    fn register_assigns_monotonic_sessions() {
        let registry = ProcessRegistry::new();
        let first = registry.register("a", 1, 0, 1, mgmt_ptr()).unwrap();
        registry.remove("a");
        let second = registry.register("a", 2, 0, 1, mgmt_ptr()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = ProcessRegistry::new();
        registry.register("a", 1, 0, 1, mgmt_ptr()).unwrap();
        assert!(matches!(
            registry.register("a", 2, 0, 1, mgmt_ptr()),
            Err(MonetError::NameTaken { .. })
        ));
    }

    #[test]
    fn stale_session_is_rejected() {
        let registry = ProcessRegistry::new();
        let session = registry.register("a", 1, 0, 1, mgmt_ptr()).unwrap();
        registry.remove("a");
        registry.register("a", 2, 0, 1, mgmt_ptr()).unwrap();

        assert!(matches!(
            registry.validate_session(session),
            Err(MonetError::StaleSession { .. })
        ));
    }

    #[test]
    fn first_request_activates() {
        let registry = ProcessRegistry::new();
        let session = registry.register("a", 1, 0, 1, mgmt_ptr()).unwrap();
        assert_eq!(registry.state_of("a"), Some(ProcessState::Registered));

        registry.validate_session(session).unwrap();
        assert_eq!(registry.state_of("a"), Some(ProcessState::Active));
    }

    #[test]
    fn expiry_reports_only_silent_processes() {
        let registry = ProcessRegistry::new();
        registry.register("quiet", 1, 0, 1, mgmt_ptr()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(registry.expired(1).contains(&"quiet".to_string()));
        assert!(registry.expired(10_000).is_empty());
    }
}
