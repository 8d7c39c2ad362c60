use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-identifier cap on requests queued or in flight.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    limit: usize,
    held: Mutex<HashMap<String, usize>>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn try_acquire(self: &Arc<Self>, identifier: &str) -> Option<ConcurrencySlot> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let count = held.entry(identifier.to_string()).or_default();
        if *count >= self.limit {
            return None;
        }
        *count += 1;
        Some(ConcurrencySlot {
            limiter: self.clone(),
            identifier: identifier.to_string(),
        })
    }

    pub fn held(&self, identifier: &str) -> usize {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(identifier).copied().unwrap_or_default()
    }

    fn release(&self, identifier: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = held.get_mut(identifier) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                held.remove(identifier);
            }
        }
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct ConcurrencySlot {
    limiter: Arc<ConcurrencyLimiter>,
    identifier: String,
}

impl ConcurrencySlot {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.limiter.release(&self.identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounded_and_released() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.try_acquire("alice").unwrap();
        let b = limiter.try_acquire("alice").unwrap();
        assert!(limiter.try_acquire("alice").is_none());
        assert!(limiter.try_acquire("bob").is_some());
        drop(a);
        assert_eq!(limiter.held("alice"), 1);
        assert!(limiter.try_acquire("alice").is_some());
        drop(b);
    }
}
