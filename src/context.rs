use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{CtConfig, TestBits};
use crate::controller::controller::ControllerHandle;
use crate::handshake::conn_end::{ConnEnd, UimAddr};
use crate::transport::Transport;
use crate::util::recent_events::RecentEvents;

pub const RECENT_EVENTS_CAPACITY: usize = 256;

/// Everything that is fixed for the lifetime of a [crate::ConnectedTopics] instance and needed
///  both on the controller task and on transport delivery tasks.
pub struct CtContext {
    pub config: CtConfig,
    /// random per-process id, see [crate::util::random::new_ct_id]
    pub ct_id: u32,
    pub local_addr: UimAddr,
    pub transport: Arc<dyn Transport>,
    pub controller: ControllerHandle,
    next_conn_id: AtomicU32,
    recent_events: Mutex<RecentEvents<RECENT_EVENTS_CAPACITY>>,
}

impl CtContext {
    pub fn new(config: CtConfig, ct_id: u32, transport: Arc<dyn Transport>, controller: ControllerHandle) -> CtContext {
        let debug = config.test_bits.contains(TestBits::DEBUG);
        CtContext {
            config,
            ct_id,
            local_addr: transport.local_addr(),
            transport,
            controller,
            next_conn_id: AtomicU32::new(0),
            recent_events: Mutex::new(RecentEvents::new(debug)),
        }
    }

    /// Connection ids are unique per process, shared between the source and the receiver side
    pub fn next_conn_id(&self) -> u32 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// This process's half of a connection with the given id
    pub fn conn_end(&self, conn_id: u32) -> ConnEnd {
        ConnEnd::new(self.ct_id, self.local_addr, conn_id)
    }

    pub fn record_event(&self, event: impl FnOnce() -> String) {
        if let Ok(mut recent_events) = self.recent_events.lock() {
            recent_events.record(event);
        }
    }

    pub fn recent_events(&self) -> Vec<String> {
        self.recent_events.lock()
            .map(|e| e.snapshot())
            .unwrap_or_default()
    }
}
