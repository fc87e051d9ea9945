// src/container/network.rs

//! Host port allocation.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use tracing::debug;

use crate::container::{PortMapping, PortRequest};
use crate::errors::{Result, StevedoreError};

/// Hands out host ports for container port mappings.
///
/// Reservations are tracked in-process; a candidate port is also probed by
/// binding it, so ports held by unrelated processes are skipped. Each
/// auto-assigned request tries at most `attempts` candidates.
#[derive(Debug)]
pub struct PortAllocator {
    range: (u16, u16),
    attempts: u32,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    reserved: HashSet<u16>,
    cursor: u16,
}

impl PortAllocator {
    pub fn new(range: (u16, u16), attempts: u32) -> Self {
        let (lo, hi) = (range.0.min(range.1), range.0.max(range.1));
        Self {
            range: (lo, hi),
            attempts: attempts.max(1),
            state: Mutex::new(AllocatorState {
                reserved: HashSet::new(),
                cursor: lo,
            }),
        }
    }

    /// Allocate every request or none of them.
    pub fn allocate(&self, requests: &[PortRequest]) -> Result<Vec<PortMapping>> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut granted: Vec<PortMapping> = Vec::with_capacity(requests.len());

        for req in requests {
            let result = match req.host_port {
                Some(port) => self.claim_explicit(&mut state, port),
                None => self.claim_any(&mut state),
            };
            match result {
                Ok(host_port) => granted.push(PortMapping {
                    container_port: req.container_port,
                    host_port,
                }),
                Err(e) => {
                    for m in &granted {
                        state.reserved.remove(&m.host_port);
                    }
                    return Err(e);
                }
            }
        }

        debug!(?granted, "ports allocated");
        Ok(granted)
    }

    pub fn release(&self, mappings: &[PortMapping]) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for m in mappings {
            state.reserved.remove(&m.host_port);
        }
    }

    /// Re-register ports of containers recovered from the store.
    pub fn reserve(&self, mappings: &[PortMapping]) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.reserved.extend(mappings.iter().map(|m| m.host_port));
    }

    pub fn reserved_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reserved
            .len()
    }

    fn claim_explicit(&self, state: &mut AllocatorState, port: u16) -> Result<u16> {
        if state.reserved.contains(&port) || !port_is_free(port) {
            return Err(StevedoreError::PortAllocationExhausted {
                requested: port.to_string(),
                attempts: 1,
            });
        }
        state.reserved.insert(port);
        Ok(port)
    }

    fn claim_any(&self, state: &mut AllocatorState) -> Result<u16> {
        let (lo, hi) = self.range;
        let span = u32::from(hi - lo) + 1;
        let tries = self.attempts.min(span);

        for _ in 0..tries {
            let candidate = state.cursor;
            state.cursor = if candidate >= hi { lo } else { candidate + 1 };

            if state.reserved.contains(&candidate) || !port_is_free(candidate) {
                continue;
            }
            state.reserved.insert(candidate);
            return Ok(candidate);
        }

        Err(StevedoreError::PortAllocationExhausted {
            requested: format!("any port in {lo}-{hi}"),
            attempts: tries,
        })
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
