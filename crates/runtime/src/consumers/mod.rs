//! Long-lived event consumers driven by the store's event queue.
//!
//! Dispatch happens in [`flush_events`], called at every point where the
//! global lock is about to be released after mutations: top-level command
//! execution, function invocation, and `block` callbacks. Handlers run
//! only while the store is primary; a replica applies replicated state but
//! never dispatches.

pub(crate) mod notifications;
pub(crate) mod stream;

use std::sync::Arc;

use quern_store::{Role, StoreEvent, StoreState};

use crate::RuntimeInner;
use crate::consumers::notifications::NotificationConsumer;
use crate::consumers::stream::StreamConsumer;

/// Drain and dispatch pending store events under the lock.
///
/// Handlers may write keys themselves; events they raise are picked up by
/// the next round of the loop, one delivery per event, until the queue is
/// quiet.
pub(crate) fn flush_events(rt: &Arc<RuntimeInner>, state: &mut StoreState) {
    loop {
        let events = state.take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            match event {
                StoreEvent::RoleChanged(Role::Primary) => promote(rt, state),
                StoreEvent::RoleChanged(Role::Replica) => {}
                StoreEvent::Key { event, key } => {
                    if state.role() == Role::Primary {
                        dispatch_key_event(rt, state, &event, &key);
                    }
                }
            }
        }
    }
}

fn dispatch_key_event(rt: &Arc<RuntimeInner>, state: &mut StoreState, event: &str, key: &str) {
    for library in rt.registry.all() {
        for consumer in &library.notifications {
            if key.starts_with(consumer.prefix.as_str()) {
                NotificationConsumer::dispatch(consumer, rt, state, &library, event, key);
            }
        }
        if event == "xadd" {
            for consumer in &library.streams {
                if key.starts_with(consumer.prefix.as_str()) {
                    StreamConsumer::pull(consumer, rt, state, &library, key);
                }
            }
        }
    }
}

/// On promotion, stream consumers resume from their replicated cursors.
fn promote(rt: &Arc<RuntimeInner>, state: &mut StoreState) {
    for library in rt.registry.all() {
        for consumer in &library.streams {
            for key in consumer.discover(state) {
                StreamConsumer::pull(consumer, rt, state, &library, &key);
            }
        }
    }
}
