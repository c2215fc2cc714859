//! Queue position estimate
//!
//! Replays the rotation without touching the store: take the oldest slot,
//! dispatch the head of that destination's queue, and give the slot back at
//! the end of the rotation while the destination still has work. Slots in
//! flight rejoin after the available ones. Nothing is ever released, so
//! the result is the order jobs would start in if every job took equally long.

use std::collections::{HashMap, VecDeque};

/// Zero-based dispatch position of `key`, or `None` if it is not queued
pub fn simulate(
    rotation: impl IntoIterator<Item = String>,
    mut queues: HashMap<String, VecDeque<String>>,
    key: &str,
) -> Option<usize> {
    let mut rotation: VecDeque<String> = rotation.into_iter().collect();
    let mut position = 0;

    while let Some(host) = rotation.pop_front() {
        let Some(queue) = queues.get_mut(&host) else {
            continue;
        };
        let Some(next) = queue.pop_front() else {
            continue;
        };

        if next == key {
            return Some(position);
        }
        position += 1;

        if !queue.is_empty() {
            rotation.push_back(host);
        }
    }

    None
}
