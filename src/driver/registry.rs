//! Correlation registry for in-flight exchanges.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::proto::Package;

/// One outstanding request/response exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Exchange {
    pub request: Package,
    pub retry_count: u32,
    pub started: Duration,
}

impl Exchange {
    pub fn new(request: Package, started: Duration) -> Self {
        Self {
            request,
            retry_count: 0,
            started,
        }
    }

    pub fn correlation(&self) -> Uuid {
        self.request.correlation
    }
}

/// Maps correlation ids to exchanges. Owned exclusively by the reactor;
/// a correlation appears at most once.
#[derive(Debug, Default)]
pub struct ExchangeRegistry {
    entries: HashMap<Uuid, Exchange>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts keyed by the request correlation, replacing any previous
    /// entry under the same id.
    pub fn insert(&mut self, exchange: Exchange) {
        self.entries.insert(exchange.correlation(), exchange);
    }

    /// Single-pass lookup and delete.
    pub fn remove_and_get(&mut self, correlation: &Uuid) -> Option<Exchange> {
        self.entries.remove(correlation)
    }

    pub fn contains(&self, correlation: &Uuid) -> bool {
        self.entries.contains_key(correlation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Exchange> + '_ {
        self.entries.drain().map(|(_, exchange)| exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn exchange(byte: u8) -> Exchange {
        let request = Package::new(0xB0, Uuid::from_bytes([byte; 16]), Bytes::new());
        Exchange::new(request, Duration::from_millis(5))
    }

    #[test]
    fn remove_and_get_deletes_in_one_pass() {
        let mut registry = ExchangeRegistry::new();
        registry.insert(exchange(1));
        registry.insert(exchange(2));
        assert_eq!(registry.len(), 2);

        let removed = registry
            .remove_and_get(&Uuid::from_bytes([1; 16]))
            .expect("exchange");
        assert_eq!(removed.correlation(), Uuid::from_bytes([1; 16]));
        assert_eq!(removed.retry_count, 0);
        assert!(!registry.contains(&Uuid::from_bytes([1; 16])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_correlation_yields_none() {
        let mut registry = ExchangeRegistry::new();
        registry.insert(exchange(1));
        assert!(registry.remove_and_get(&Uuid::from_bytes([9; 16])).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reinsert_replaces_entry() {
        let mut registry = ExchangeRegistry::new();
        let mut first = exchange(4);
        registry.insert(first.clone());
        first.retry_count = 3;
        registry.insert(first);

        let got = registry
            .remove_and_get(&Uuid::from_bytes([4; 16]))
            .expect("exchange");
        assert_eq!(got.retry_count, 3);
        assert!(registry.is_empty());
    }
}
