use serde::Serialize;

/// A named pool of `capacity` permits with weighted-semaphore semantics.
///
/// Not synchronized on its own: groups live inside the
/// [`ResourceManager`](super::ResourceManager) table and are only touched
/// under its lock.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    name: String,
    capacity: i64,
    held: i64,
}

/// Read-only view of a group, as reported by status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub capacity: i64,
    pub held: i64,
}

impl ResourceGroup {
    pub fn new(name: impl Into<String>, capacity: i64) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(0),
            held: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn held(&self) -> i64 {
        self.held
    }

    pub fn available(&self) -> i64 {
        self.capacity - self.held
    }

    /// Grant `n` permits if they are all available right now. Never waits.
    pub fn try_acquire(&mut self, n: i64) -> bool {
        if n < 0 || n > self.available() {
            return false;
        }
        self.held += n;
        true
    }

    /// Return `n` permits. Over-release is clamped so `held` stays >= 0.
    pub fn release(&mut self, n: i64) {
        self.held = (self.held - n.max(0)).max(0);
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            name: self.name.clone(),
            capacity: self.capacity,
            held: self.held,
        }
    }
}
