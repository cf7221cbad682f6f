//! Request/response correlation table.
//!
//! One matcher per protocol, keyed by a connection-embedding correlation key.
//! Each key holds at most one pending message. Every operation on a key goes
//! through the map's entry API, so pairing is atomic per key and a pair is
//! produced exactly once.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{GenericMessage, RequestResponsePair};

/// What to do with a response whose request has not been seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Park the response; a later request completes the pair.
    Store,
    /// Block the caller until the request arrives or the timeout passes.
    /// The response is discarded on timeout.
    Wait(Duration),
}

enum Slot<T> {
    Request(GenericMessage<T>),
    Response(GenericMessage<T>),
    Waiter { token: u64, tx: Sender<GenericMessage<T>> },
}

struct Pending<T> {
    slot: Slot<T>,
    registered_at: Instant,
}

impl<T> Pending<T> {
    fn new(slot: Slot<T>) -> Self {
        Self {
            slot,
            registered_at: Instant::now(),
        }
    }
}

pub struct RequestResponseMatcher<T> {
    pending: DashMap<String, Pending<T>>,
    policy: MatchPolicy,
    next_token: AtomicU64,
    unmatched: AtomicU64,
}

impl<T: Send> RequestResponseMatcher<T> {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            pending: DashMap::new(),
            policy,
            next_token: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Register a request. Returns the pair if its response was already pending.
    pub fn register_request(
        &self,
        key: String,
        request: GenericMessage<T>,
    ) -> Option<RequestResponsePair<T>> {
        match self.pending.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Pending::new(Slot::Request(request)));
                None
            }
            Entry::Occupied(mut occupied) => match occupied.get().slot {
                Slot::Request(_) => {
                    debug!("Displacing pending request under {}", occupied.key());
                    occupied.insert(Pending::new(Slot::Request(request)));
                    None
                }
                Slot::Response(_) => match occupied.remove().slot {
                    Slot::Response(response) => Some(RequestResponsePair { request, response }),
                    _ => None,
                },
                Slot::Waiter { .. } => {
                    // The waiting response side builds and emits the pair.
                    if let Slot::Waiter { tx, .. } = occupied.remove().slot {
                        let _ = tx.send(request);
                    }
                    None
                }
            },
        }
    }

    /// Register a response. Returns the pair if its request is (or, under
    /// [`MatchPolicy::Wait`], becomes) available.
    pub fn register_response(
        &self,
        key: String,
        response: GenericMessage<T>,
    ) -> Option<RequestResponsePair<T>> {
        let (token, rx, timeout) = match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) if matches!(occupied.get().slot, Slot::Request(_)) => {
                return match occupied.remove().slot {
                    Slot::Request(request) => Some(RequestResponsePair { request, response }),
                    _ => None,
                };
            }
            entry => match self.policy {
                MatchPolicy::Store => {
                    entry.insert(Pending::new(Slot::Response(response)));
                    return None;
                }
                MatchPolicy::Wait(timeout) => {
                    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = channel::bounded(1);
                    entry.insert(Pending::new(Slot::Waiter { token, tx }));
                    (token, rx, timeout)
                }
            },
        };

        let request = match rx.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) => {
                let withdrawn = self
                    .pending
                    .remove_if(&key, |_, p| {
                        matches!(p.slot, Slot::Waiter { token: t, .. } if t == token)
                    })
                    .is_some();
                if withdrawn {
                    None
                } else {
                    // A request claimed the slot after the timeout fired.
                    rx.recv().ok()
                }
            }
            Err(RecvTimeoutError::Disconnected) => None,
        };

        match request {
            Some(request) => Some(RequestResponsePair { request, response }),
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding response without request under {}", key);
                None
            }
        }
    }

    /// Remove every pending entry registered at or before `threshold`.
    pub fn delete_older_than(&self, threshold: Instant) -> usize {
        let mut deleted = 0;
        self.pending.retain(|_, pending| {
            let keep = pending.registered_at > threshold;
            if !keep {
                deleted += 1;
            }
            keep
        });
        deleted
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Responses discarded because no request showed up in time.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::SystemTime;

    fn message(is_request: bool, payload: &str) -> GenericMessage<String> {
        GenericMessage {
            is_request,
            capture_time: SystemTime::now(),
            capture_size: payload.len(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_request_then_response() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Store);
        assert!(
            matcher
                .register_request("k".into(), message(true, "GET"))
                .is_none()
        );
        let pair = matcher
            .register_response("k".into(), message(false, "200"))
            .expect("pair");
        assert_eq!(pair.request.payload, "GET");
        assert_eq!(pair.response.payload, "200");
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_response_then_request() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Store);
        assert!(
            matcher
                .register_response("k".into(), message(false, "200"))
                .is_none()
        );
        let pair = matcher
            .register_request("k".into(), message(true, "GET"))
            .expect("pair");
        assert_eq!(pair.response.payload, "200");
        assert!(matcher.is_empty());

        // A second response under the same key does not re-pair.
        assert!(
            matcher
                .register_response("k".into(), message(false, "404"))
                .is_none()
        );
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn test_keys_do_not_cross() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Store);
        matcher.register_request("a".into(), message(true, "GET"));
        assert!(
            matcher
                .register_response("b".into(), message(false, "200"))
                .is_none()
        );
        assert_eq!(matcher.len(), 2);
    }

    #[test]
    fn test_delete_older_than() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Store);
        matcher.register_request("k".into(), message(true, "GET"));
        let registered = Instant::now();

        assert_eq!(
            matcher.delete_older_than(registered - Duration::from_secs(5)),
            0
        );
        assert_eq!(matcher.len(), 1);

        assert_eq!(matcher.delete_older_than(registered), 1);
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_wait_policy_pairs_with_late_request() {
        let matcher = Arc::new(RequestResponseMatcher::new(MatchPolicy::Wait(
            Duration::from_secs(5),
        )));

        let waiter = {
            let matcher = Arc::clone(&matcher);
            thread::spawn(move || matcher.register_response("k".into(), message(false, "resp")))
        };

        // Let the response park itself first.
        while matcher.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(
            matcher
                .register_request("k".into(), message(true, "req"))
                .is_none()
        );

        let pair = waiter.join().unwrap().expect("pair");
        assert_eq!(pair.request.payload, "req");
        assert!(matcher.is_empty());
        assert_eq!(matcher.unmatched(), 0);
    }

    #[test]
    fn test_wait_policy_times_out() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Wait(Duration::from_millis(20)));
        assert!(
            matcher
                .register_response("k".into(), message(false, "resp"))
                .is_none()
        );
        assert!(matcher.is_empty());
        assert_eq!(matcher.unmatched(), 1);
    }

    #[test]
    fn test_wait_policy_with_request_already_pending() {
        let matcher = RequestResponseMatcher::new(MatchPolicy::Wait(Duration::from_secs(5)));
        matcher.register_request("k".into(), message(true, "req"));
        let pair = matcher
            .register_response("k".into(), message(false, "resp"))
            .expect("pair");
        assert_eq!(pair.request.payload, "req");
    }
}
