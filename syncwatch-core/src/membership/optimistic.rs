//! Optimistic mutation with rollback
//!
//! Snapshot the previous value of everything a mutation touches, apply the
//! new value locally, perform the remote write, and on failure restore the
//! snapshot. Every host operation goes through this one helper.

use tracing::warn;

#[derive(Debug)]
pub struct Transaction<K, V> {
    label: &'static str,
    previous: Vec<(K, V)>,
}

impl<K: PartialEq, V> Transaction<K, V> {
    pub fn begin(label: &'static str) -> Self {
        Self {
            label,
            previous: Vec::new(),
        }
    }

    /// Remember `value` as the pre-mutation state of `key` (first write wins)
    pub fn record(&mut self, key: K, value: V) {
        if !self.previous.iter().any(|(k, _)| *k == key) {
            self.previous.push((key, value));
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.previous.iter().map(|(k, _)| k)
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    /// Hand every snapshot back to `restore`
    pub fn rollback(self, mut restore: impl FnMut(K, V)) {
        warn!("Rolling back {} ({} entries)", self.label, self.previous.len());
        for (key, value) in self.previous {
            restore(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rollback_restores_first_snapshot() {
        let mut state: HashMap<&str, i32> = HashMap::from([("a", 1), ("b", 2)]);
        let mut txn = Transaction::begin("test");

        txn.record("a", state["a"]);
        state.insert("a", 10);
        txn.record("a", state["a"]);
        state.insert("a", 20);
        txn.record("b", state["b"]);
        state.insert("b", 30);

        txn.rollback(|k, v| {
            state.insert(k, v);
        });
        assert_eq!(state["a"], 1);
        assert_eq!(state["b"], 2);
    }
}
