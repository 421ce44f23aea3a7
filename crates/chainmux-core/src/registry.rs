//! Per-chain subscription registry.
//!
//! Maps each [`SubscriptionKey`] to a reference count plus the wire messages
//! needed to establish and tear down that subscription. Pure bookkeeping:
//! nothing here touches the network. The caller decides what to send based
//! on the 0→1 and 1→0 transitions reported back.

use std::collections::BTreeMap;

use crate::chain::ChainId;
use crate::error::MuxError;
use crate::key::SubscriptionKey;
use crate::message::OutboundMessage;

/// Live registry entry. Messages are fixed by the first acquirer.
#[derive(Debug, Clone)]
struct Entry {
    ref_count: u32,
    subscribe: OutboundMessage,
    unsubscribe: OutboundMessage,
}

/// Outcome of [`Registry::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// This call caused the 0→1 transition.
    pub is_new_subscription: bool,
    pub ref_count: u32,
}

/// Outcome of a successful [`Registry::release`].
#[derive(Debug, Clone, PartialEq)]
pub enum Released {
    /// Other callers still hold the key.
    Retained { ref_count: u32 },
    /// This call caused the 1→0 transition; the entry is gone.
    Last { unsubscribe: OutboundMessage },
}

impl Released {
    pub fn is_last_release(&self) -> bool {
        matches!(self, Self::Last { .. })
    }
}

/// Reference-counted subscriptions for one chain.
///
/// Entries exist only while their count is positive; the 1→0 release removes
/// the entry, so a later replay can never resurrect it.
#[derive(Debug)]
pub struct Registry {
    chain: ChainId,
    entries: BTreeMap<SubscriptionKey, Entry>,
}

impl Registry {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            entries: BTreeMap::new(),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Increment the count for `key`, creating the entry on first use.
    ///
    /// When the entry already exists the supplied messages are ignored.
    pub fn acquire(
        &mut self,
        key: SubscriptionKey,
        subscribe: OutboundMessage,
        unsubscribe: OutboundMessage,
    ) -> Acquired {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.ref_count += 1;
                Acquired {
                    is_new_subscription: false,
                    ref_count: entry.ref_count,
                }
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        ref_count: 1,
                        subscribe,
                        unsubscribe,
                    },
                );
                Acquired {
                    is_new_subscription: true,
                    ref_count: 1,
                }
            }
        }
    }

    /// Decrement the count for `key`.
    ///
    /// Fails with [`MuxError::UnknownKey`] if there is no live entry, which
    /// means a caller released more often than it acquired.
    pub fn release(&mut self, key: &SubscriptionKey) -> Result<Released, MuxError> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Err(MuxError::UnknownKey {
                chain: self.chain,
                key: key.clone(),
            });
        };
        if entry.ref_count > 1 {
            entry.ref_count -= 1;
            return Ok(Released::Retained {
                ref_count: entry.ref_count,
            });
        }
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| MuxError::UnknownKey {
                chain: self.chain,
                key: key.clone(),
            })?;
        Ok(Released::Last {
            unsubscribe: entry.unsubscribe,
        })
    }

    /// Snapshot of every referenced subscription, ordered by key.
    pub fn active_entries(&self) -> Vec<(SubscriptionKey, OutboundMessage)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.subscribe.clone()))
            .collect()
    }

    /// Current count for `key` (0 if absent).
    pub fn ref_count(&self, key: &SubscriptionKey) -> u32 {
        self.entries.get(key).map_or(0, |e| e.ref_count)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    /// Number of distinct live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SubscriptionSpec;

    fn spec(contract: &str) -> SubscriptionSpec {
        SubscriptionSpec::new("token.updated")
            .filter("contract", contract)
            .changed("price")
    }

    fn acquire(reg: &mut Registry, s: &SubscriptionSpec) -> Acquired {
        reg.acquire(s.key(), s.subscribe_message(), s.unsubscribe_message())
    }

    #[test]
    fn first_acquire_is_new() {
        let mut reg = Registry::new(ChainId(1));
        let a = spec("0xabc");
        assert!(acquire(&mut reg, &a).is_new_subscription);
        let second = acquire(&mut reg, &a);
        assert!(!second.is_new_subscription);
        assert_eq!(second.ref_count, 2);
        assert_eq!(reg.ref_count(&a.key()), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn last_release_removes_entry() {
        let mut reg = Registry::new(ChainId(1));
        let a = spec("0xabc");
        acquire(&mut reg, &a);
        acquire(&mut reg, &a);

        let r1 = reg.release(&a.key()).unwrap();
        assert_eq!(r1, Released::Retained { ref_count: 1 });

        let r2 = reg.release(&a.key()).unwrap();
        assert!(r2.is_last_release());
        assert_eq!(
            r2,
            Released::Last {
                unsubscribe: a.unsubscribe_message()
            }
        );
        assert!(reg.is_empty());
        assert!(reg.active_entries().is_empty());
    }

    #[test]
    fn release_unknown_key_errors() {
        let mut reg = Registry::new(ChainId(1));
        let err = reg.release(&SubscriptionKey::from("nope")).unwrap_err();
        assert!(matches!(err, MuxError::UnknownKey { chain: ChainId(1), .. }));
    }

    #[test]
    fn double_release_errors_after_removal() {
        let mut reg = Registry::new(ChainId(1));
        let a = spec("0xabc");
        acquire(&mut reg, &a);
        reg.release(&a.key()).unwrap();
        assert!(matches!(
            reg.release(&a.key()),
            Err(MuxError::UnknownKey { .. })
        ));
    }

    #[test]
    fn first_acquirer_messages_win() {
        let mut reg = Registry::new(ChainId(1));
        let a = spec("0xabc");
        acquire(&mut reg, &a);

        let mut other = a.subscribe_message();
        other.event = "something.else".into();
        reg.acquire(a.key(), other, a.unsubscribe_message());

        let active = reg.active_entries();
        assert_eq!(active[0].1, a.subscribe_message());
    }

    #[test]
    fn active_entries_are_sorted_by_key() {
        let mut reg = Registry::new(ChainId(1));
        let b = spec("0xbbb");
        let a = spec("0xaaa");
        acquire(&mut reg, &b);
        acquire(&mut reg, &a);
        let keys: Vec<_> = reg.active_entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![a.key(), b.key()]);
    }

    #[test]
    fn acquire_release_acquire_matches_single_acquire() {
        let mut reg = Registry::new(ChainId(1));
        let a = spec("0xabc");
        assert!(acquire(&mut reg, &a).is_new_subscription);
        assert!(reg.release(&a.key()).unwrap().is_last_release());
        assert!(acquire(&mut reg, &a).is_new_subscription);
        assert_eq!(reg.ref_count(&a.key()), 1);
        assert_eq!(reg.len(), 1);
    }
}
