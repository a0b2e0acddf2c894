//! Table of in-flight operations
//!
//! Every asynchronous dispatch registers its handle here. Collective entries
//! hold the input buffer so it stays alive while the provider may still read
//! it; window entries remember which window the operation touches.
//!
//! A collective name is claimed before dispatch and released when its handle
//! is consumed, so two in-flight collectives never share a rendezvous key.

use crate::handle::Handle;
use crate::ops::OpKind;
use dashmap::{DashMap, DashSet};
use weft_core::Tensor;

/// What a registered handle owns
#[derive(Debug, Clone)]
pub enum Registered {
    /// Collective operation buffers
    Collective {
        name: String,
        input: Tensor,
        output: Tensor,
    },
    /// One-sided window operation
    Window { name: String, op: OpKind },
}

/// Handle to owned-buffer table for one communicator
#[derive(Debug, Default)]
pub struct OperationRegistry {
    entries: DashMap<Handle, Registered>,
    names: DashSet<String>,
}

impl OperationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a collective name. Returns `false` when an unconsumed
    /// collective already holds it.
    pub fn claim_name(&self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    /// Give back a name whose dispatch never happened
    pub fn release_name(&self, name: &str) {
        self.names.remove(name);
    }

    /// Whether an unconsumed collective holds `name`
    pub fn is_name_claimed(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Register a collective's buffers under a claimed name
    pub fn register_collective(
        &self,
        handle: Handle,
        name: impl Into<String>,
        input: Tensor,
        output: Tensor,
    ) {
        self.entries.insert(
            handle,
            Registered::Collective {
                name: name.into(),
                input,
                output,
            },
        );
    }

    /// Register a window operation
    pub fn register_window(&self, handle: Handle, name: impl Into<String>, op: OpKind) {
        self.entries.insert(
            handle,
            Registered::Window {
                name: name.into(),
                op,
            },
        );
    }

    /// Remove a collective entry and release its name, returning
    /// `(input, output)`
    pub fn take_collective(&self, handle: Handle) -> Option<(Tensor, Tensor)> {
        match self
            .entries
            .remove_if(&handle, |_, entry| matches!(entry, Registered::Collective { .. }))
        {
            Some((
                _,
                Registered::Collective {
                    name,
                    input,
                    output,
                },
            )) => {
                self.names.remove(&name);
                Some((input, output))
            }
            _ => None,
        }
    }

    /// Remove a window entry, returning the window name
    pub fn take_window(&self, handle: Handle) -> Option<String> {
        match self
            .entries
            .remove_if(&handle, |_, entry| matches!(entry, Registered::Window { .. }))
        {
            Some((_, Registered::Window { name, .. })) => Some(name),
            _ => None,
        }
    }

    /// Whether `handle` is registered as a collective
    pub fn is_collective(&self, handle: Handle) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|entry| matches!(*entry, Registered::Collective { .. }))
    }

    /// Whether `handle` is registered as a window operation
    pub fn is_window(&self, handle: Handle) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|entry| matches!(*entry, Registered::Window { .. }))
    }

    /// Outstanding operations on window `name`, oldest first
    pub fn pending_on_window(&self, name: &str) -> Vec<(Handle, OpKind)> {
        let mut pending: Vec<(Handle, OpKind)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Registered::Window { name: window, op } if window == name => {
                    Some((*entry.key(), *op))
                }
                _ => None,
            })
            .collect();
        pending.sort_by_key(|(handle, _)| *handle);
        pending
    }

    /// Number of outstanding handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, returning how many were outstanding
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.names.clear();
        count
    }
}
