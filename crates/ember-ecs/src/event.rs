//! Double-buffered event channels.
//!
//! Each channel holds events of one type in two buffers: the current
//! one, which receives sends, and the previous one, retired by the last
//! buffer swap. An event therefore stays readable for one full swap
//! cycle after the cycle it was sent in, then drops. Readers track
//! their own [`EventCursor`], so several readers consume the same
//! channel independently, each seeing every event at most once and in
//! send order. A reader that falls more than one swap behind silently
//! skips the events it missed and resumes at the oldest still-buffered
//! event.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::reflect::{Component, Ref, TypeInfo, TypeKey, Value};
use crate::EcsError;

/// A reader's position in a channel: which buffer cycle, and how far
/// into it. `Default` starts at the beginning of the channel's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCursor {
    generation: u64,
    index: usize,
}

/// One event channel: type-erased storage for events of a single type.
#[derive(Debug)]
pub struct Events {
    info: Arc<TypeInfo>,
    /// Events sent since the last swap.
    front: Vec<Value>,
    /// Events from the previous cycle, readable until the next swap.
    back: Vec<Value>,
    /// Number of swaps so far; the front buffer's cycle number.
    generation: u64,
}

impl Events {
    pub(crate) fn new(info: Arc<TypeInfo>) -> Self {
        Self {
            info,
            front: Vec::new(),
            back: Vec::new(),
            generation: 0,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.info.name
    }

    pub fn key(&self) -> TypeKey {
        self.info.key
    }

    /// Sends one event into the current buffer.
    pub fn send<E: Component>(&mut self, event: E) -> Result<(), EcsError> {
        if self.info.rust_id != TypeId::of::<E>() {
            return Err(EcsError::TypeMismatch {
                expected: self.info.name.clone(),
                found: std::any::type_name::<E>().to_owned(),
            });
        }
        self.front.push(Value::from_typed(self.info.clone(), event));
        Ok(())
    }

    /// Sends an already-erased event value.
    pub fn send_value(&mut self, value: Value) -> Result<(), EcsError> {
        if value.key() != self.info.key {
            return Err(EcsError::TypeMismatch {
                expected: self.info.name.clone(),
                found: value.type_name().to_owned(),
            });
        }
        self.front.push(value);
        Ok(())
    }

    /// Retires the current buffer. Events that were already retired
    /// drop here; events in the current buffer stay readable for one
    /// more cycle.
    pub fn swap(&mut self) {
        self.back = std::mem::take(&mut self.front);
        self.generation += 1;
    }

    /// Number of events in the current buffer.
    pub fn len(&self) -> usize {
        self.front.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Yields the next unread event for `cursor`, advancing it. Drains
    /// the previous buffer before moving on to the current one.
    pub fn read(&self, cursor: &mut EventCursor) -> Option<Ref<'_>> {
        // More than one swap behind: the missed events are gone, resume
        // at the oldest still-buffered cycle.
        if cursor.generation + 1 < self.generation {
            cursor.generation = self.generation - 1;
            cursor.index = 0;
        }
        if cursor.generation + 1 == self.generation {
            if let Some(value) = self.back.get(cursor.index) {
                cursor.index += 1;
                return Some(value.as_ref());
            }
            cursor.generation = self.generation;
            cursor.index = 0;
        }
        debug_assert!(cursor.generation == self.generation);
        if let Some(value) = self.front.get(cursor.index) {
            cursor.index += 1;
            return Some(value.as_ref());
        }
        None
    }
}

/// Typed pull-style reader over one channel.
pub struct EventReader<'a, E> {
    events: &'a Events,
    cursor: &'a mut EventCursor,
    _marker: PhantomData<E>,
}

impl<'a, E: Component> EventReader<'a, E> {
    pub(crate) fn new(events: &'a Events, cursor: &'a mut EventCursor) -> Self {
        debug_assert_eq!(events.info.rust_id, TypeId::of::<E>());
        Self {
            events,
            cursor,
            _marker: PhantomData,
        }
    }

    /// The next unread event, if any.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&'a E> {
        let value = self.events.read(self.cursor)?;
        // The channel is keyed by `E`, so the downcast cannot fail.
        Some(value.get::<E>().expect("event channel type mismatch"))
    }
}

/// Typed sender into one channel.
pub struct EventWriter<'a, E> {
    events: &'a mut Events,
    _marker: PhantomData<E>,
}

impl<'a, E: Component> EventWriter<'a, E> {
    pub(crate) fn new(events: &'a mut Events) -> Self {
        debug_assert_eq!(events.info.rust_id, TypeId::of::<E>());
        Self {
            events,
            _marker: PhantomData,
        }
    }

    pub fn send(&mut self, event: E) {
        self.events
            .front
            .push(Value::from_typed(self.events.info.clone(), event));
    }
}
