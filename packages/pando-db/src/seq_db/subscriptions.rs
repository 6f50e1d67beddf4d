//! Waiters on entry creation, keyed by the awaited key.

use std::collections::HashMap;

use crate::filter::{Mutation, Wake};
use crate::key::DbKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub subscriber: DbKey,
    pub wake: Wake,
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    waiting: HashMap<DbKey, Vec<Waiter>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; an identical waiter is kept once.
    pub fn register(&mut self, wait_key: DbKey, subscriber: DbKey, wake: Wake) {
        let waiter = Waiter { subscriber, wake };
        let list = self.waiting.entry(wait_key).or_default();
        if !list.contains(&waiter) {
            list.push(waiter);
        }
    }

    /// Remove and return the wakes for everything waiting on `key`.
    pub fn fire(&mut self, key: &DbKey) -> Vec<Mutation> {
        self.waiting
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .map(|w| Mutation::from_wake(w.subscriber, w.wake))
            .collect()
    }

    pub fn waiting_on(&self, key: &DbKey) -> &[Waiter] {
        self.waiting.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of waiters.
    pub fn len(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}
