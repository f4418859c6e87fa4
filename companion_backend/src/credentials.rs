//! Provider credential rotation.
//!
//! The pool is owned by the runtime and shared by `Arc` with every request
//! handler. Rotation is a best-effort failover hint: each `rotate()` call moves
//! the pointer exactly one slot, and concurrent rotations are serialized by a
//! compare-and-swap loop so none of them skips a credential.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::CompletionError;

pub struct CredentialPool {
    credentials: Vec<String>,
    active_index: AtomicUsize,
}

impl CredentialPool {
    pub fn new<I, S>(credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials = credentials
            .into_iter()
            .map(|key| {
                let key: String = key.into();
                key.trim().to_string()
            })
            .filter(|key| !key.is_empty())
            .collect();
        Self {
            credentials,
            active_index: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::Acquire)
    }

    /// The credential currently in use.
    pub fn current(&self) -> Result<&str, CompletionError> {
        if self.credentials.is_empty() {
            return Err(CompletionError::empty_pool());
        }
        let index = self.active_index() % self.credentials.len();
        Ok(self.credentials[index].as_str())
    }

    /// Advance to the next credential, wrapping at the end. Returns the new index.
    pub fn rotate(&self) -> usize {
        let len = self.credentials.len();
        if len == 0 {
            return 0;
        }
        let previous = self
            .active_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |index| {
                Some((index + 1) % len)
            })
            .unwrap_or_else(|index| index);
        let next = (previous + 1) % len;
        tracing::warn!("Switching provider credential to index {}", next);
        next
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.credentials.len())
            .field("active_index", &self.active_index())
            .finish()
    }
}
