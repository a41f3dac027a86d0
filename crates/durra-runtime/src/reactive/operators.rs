// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pure operator semantics.
//!
//! Every operator maps the emission of its upstream over the messages seen so
//! far to a new emission. Nothing here touches a store; evaluating the same log
//! prefix always gives the same answer, which is what makes replay safe.

use durra_core::{CoreError, StoredMessage};

use crate::messages::{self, MessageType, TimeoutEvent};

/// One emitted value and the log position that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Item<T> {
    /// Position of the (last) message the value came from.
    pub position: i64,
    /// The value.
    pub value: T,
}

/// What a chain has produced for a log prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission<T> {
    /// Values in emission order.
    pub items: Vec<Item<T>>,
    /// Position of the message that completed the stream, `-1` when it
    /// completed before any message.
    pub completed_at: Option<i64>,
    /// The stream was completed by a timeout.
    pub timed_out: bool,
}

impl<T> Emission<T> {
    fn open(items: Vec<Item<T>>) -> Self {
        Self {
            items,
            completed_at: None,
            timed_out: false,
        }
    }

    /// Whether no further values can be emitted.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn with_items<U>(self, items: Vec<Item<U>>) -> Emission<U> {
        Emission {
            items,
            completed_at: self.completed_at,
            timed_out: self.timed_out,
        }
    }
}

pub(crate) fn source(messages: &[StoredMessage]) -> Emission<StoredMessage> {
    Emission::open(
        messages
            .iter()
            .map(|m| Item {
                position: m.position,
                value: m.clone(),
            })
            .collect(),
    )
}

pub(crate) fn of_type<T: MessageType>(messages: &[StoredMessage]) -> Result<Emission<T>, CoreError> {
    let mut items = Vec::new();
    for message in messages {
        if let Some(value) = messages::decode::<T>(message)? {
            items.push(Item {
                position: message.position,
                value,
            });
        }
    }
    Ok(Emission::open(items))
}

pub(crate) fn filter<T>(emission: Emission<T>, predicate: &dyn Fn(&T) -> bool) -> Emission<T> {
    let Emission {
        items,
        completed_at,
        timed_out,
    } = emission;
    Emission {
        items: items.into_iter().filter(|item| predicate(&item.value)).collect(),
        completed_at,
        timed_out,
    }
}

pub(crate) fn map<T, U>(mut emission: Emission<T>, f: &dyn Fn(T) -> U) -> Emission<U> {
    let items = std::mem::take(&mut emission.items)
        .into_iter()
        .map(|item| Item {
            position: item.position,
            value: f(item.value),
        })
        .collect();
    emission.with_items(items)
}

/// Complete at the `count`th value. Upstream items already stop at a timeout,
/// so completing here always comes first and clears `timed_out`.
pub(crate) fn take<T>(mut emission: Emission<T>, count: usize) -> Emission<T> {
    if count == 0 {
        emission.items.clear();
        emission.completed_at = Some(-1);
        emission.timed_out = false;
        return emission;
    }
    if emission.items.len() >= count {
        emission.items.truncate(count);
        emission.completed_at = emission.items.last().map(|item| item.position);
        emission.timed_out = false;
    }
    emission
}

pub(crate) fn skip<T>(mut emission: Emission<T>, count: usize) -> Emission<T> {
    let count = count.min(emission.items.len());
    emission.items.drain(..count);
    emission
}

/// Emit until the first value matching `predicate`; that value completes the
/// stream and is not emitted.
pub(crate) fn take_until<T>(mut emission: Emission<T>, predicate: &dyn Fn(&T) -> bool) -> Emission<T> {
    if let Some(index) = emission.items.iter().position(|item| predicate(&item.value)) {
        let stop = emission.items[index].position;
        emission.items.truncate(index);
        emission.completed_at = Some(stop);
        emission.timed_out = false;
    }
    emission
}

/// Group values into chunks of `size`; a partial chunk is flushed on completion.
pub(crate) fn buffer<T>(mut emission: Emission<T>, size: usize) -> Emission<Vec<T>> {
    let size = size.max(1);
    let completed = emission.is_completed();
    let mut chunks = Vec::new();
    let mut current: Vec<T> = Vec::with_capacity(size);
    let mut last_position = -1;

    for item in std::mem::take(&mut emission.items) {
        last_position = item.position;
        current.push(item.value);
        if current.len() == size {
            chunks.push(Item {
                position: last_position,
                value: std::mem::replace(&mut current, Vec::with_capacity(size)),
            });
        }
    }
    if completed && !current.is_empty() {
        chunks.push(Item {
            position: last_position,
            value: current,
        });
    }
    emission.with_items(chunks)
}

/// Interleave two emissions by log position; complete once both have.
///
/// The merged stream timed out when the side that completed last did.
pub(crate) fn merge<T>(left: Emission<T>, right: Emission<T>) -> Emission<T> {
    let (completed_at, timed_out) = match (left.completed_at, right.completed_at) {
        (Some(a), Some(b)) if a > b => (Some(a), left.timed_out),
        (Some(a), Some(b)) if b > a => (Some(b), right.timed_out),
        (Some(a), Some(_)) => (Some(a), left.timed_out || right.timed_out),
        _ => (None, false),
    };
    let mut items = left.items;
    items.extend(right.items);
    items.sort_by_key(|item| item.position);
    Emission {
        items,
        completed_at,
        timed_out,
    }
}

/// Complete the stream at `fired_at` unless it completed on its own before.
pub(crate) fn timeout<T>(mut emission: Emission<T>, fired_at: Option<i64>) -> Emission<T> {
    let Some(fired_at) = fired_at else {
        return emission;
    };
    if emission.completed_at.is_some_and(|at| at < fired_at) {
        return emission;
    }
    emission.items.retain(|item| item.position < fired_at);
    emission.completed_at = Some(fired_at);
    emission.timed_out = true;
    emission
}

/// Position of the first event for `timeout_id`, if it fired.
pub(crate) fn fired_at(messages: &[StoredMessage], timeout_id: &str) -> Result<Option<i64>, CoreError> {
    for message in messages {
        if let Some(event) = messages::decode::<TimeoutEvent>(message)?
            && event.timeout_id == timeout_id
        {
            return Ok(Some(message.position));
        }
    }
    Ok(None)
}
