use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

type Key = (String, String);

/// Content hashes currently being embedded, so concurrent callers wait for the
/// owner instead of sending the same text again.
///
/// Waiters are woken when the owner's [`Claim`] drops, whether it succeeded or not.
#[derive(Debug, Default)]
pub(super) struct InFlight {
    keys: Mutex<HashMap<Key, watch::Sender<()>>>,
}

impl InFlight {
    /// Take ownership of every hash nobody else is embedding and subscribe to the rest.
    pub(super) fn claim(
        &self,
        model_id: &str,
        hashes: &[String],
    ) -> (Claim<'_>, Vec<watch::Receiver<()>>) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let mut owned = Vec::new();
        let mut waiting = Vec::new();
        for h in hashes {
            match keys.entry((model_id.to_owned(), h.clone())) {
                Entry::Occupied(e) => waiting.push(e.get().subscribe()),
                Entry::Vacant(e) => {
                    e.insert(watch::channel(()).0);
                    owned.push(h.clone());
                }
            }
        }
        (
            Claim {
                in_flight: self,
                model_id: model_id.to_owned(),
                hashes: owned,
            },
            waiting,
        )
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Ownership of a set of hashes. Release only after the vectors are in the cache.
pub(super) struct Claim<'a> {
    in_flight: &'a InFlight,
    model_id: String,
    pub(super) hashes: Vec<String>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut keys = self
            .in_flight
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for h in self.hashes.drain(..) {
            keys.remove(&(self.model_id.clone(), h));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn second_claim_waits_on_first() {
        let in_flight = InFlight::default();
        let (first, waiting) = in_flight.claim("m", &hashes(&["a", "b"]));
        assert_eq!(first.hashes, hashes(&["a", "b"]));
        assert!(waiting.is_empty());

        let (second, waiting) = in_flight.claim("m", &hashes(&["b", "c"]));
        assert_eq!(second.hashes, hashes(&["c"]));
        assert_eq!(waiting.len(), 1);
        assert_eq!(in_flight.len(), 3);
    }

    #[test]
    fn other_model_is_independent() {
        let in_flight = InFlight::default();
        let (_a, _) = in_flight.claim("m1", &hashes(&["a"]));
        let (b, waiting) = in_flight.claim("m2", &hashes(&["a"]));
        assert_eq!(b.hashes, hashes(&["a"]));
        assert!(waiting.is_empty());
    }

    #[tokio::test]
    async fn dropping_claim_wakes_waiters_and_frees_keys() {
        let in_flight = InFlight::default();
        let (owner, _) = in_flight.claim("m", &hashes(&["a"]));
        let (_, mut waiting) = in_flight.claim("m", &hashes(&["a"]));
        let mut rx = waiting.pop().unwrap();

        drop(owner);
        assert!(rx.changed().await.is_err());
        assert_eq!(in_flight.len(), 0);

        let (again, waiting) = in_flight.claim("m", &hashes(&["a"]));
        assert_eq!(again.hashes, hashes(&["a"]));
        assert!(waiting.is_empty());
    }
}
