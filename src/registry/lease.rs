//! Lease state owned by the registration loop.

use crate::store::LeaseId;

/// Where the loop stands with its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No lease; the next tick grants one and registers every key.
    Unbound,
    /// Holding a live lease.
    Bound(LeaseId),
    /// A keep-alive for this lease is in flight.
    Renewing(LeaseId),
}

/// The loop's lease. Only the registration loop mutates it.
#[derive(Debug)]
pub struct Lease {
    state: LeaseState,
}

impl Lease {
    pub fn new() -> Self {
        Self {
            state: LeaseState::Unbound,
        }
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn bind(&mut self, id: LeaseId) {
        self.state = LeaseState::Bound(id);
    }

    /// Mark a keep-alive as started. Returns the lease being renewed.
    pub fn begin_renewal(&mut self) -> Option<LeaseId> {
        match self.state {
            LeaseState::Bound(id) => {
                self.state = LeaseState::Renewing(id);
                Some(id)
            }
            _ => None,
        }
    }

    pub fn renewed(&mut self) {
        if let LeaseState::Renewing(id) = self.state {
            self.state = LeaseState::Bound(id);
        }
    }

    pub fn reset(&mut self) {
        self.state = LeaseState::Unbound;
    }
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}
