//! Push-stream events and listener bookkeeping.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::chunk::Chunk;
use crate::error::StreamError;

/// The kinds of event a push stream emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A chunk is available to the consumer.
    Data,
    /// The readable side delivered its last chunk.
    End,
    /// The writable side flushed every write and ran its final hook.
    Finish,
    /// The write queue emptied after a write reported backpressure.
    Drain,
    /// The stream failed.
    Error,
    /// The stream is fully torn down. Always the last event.
    Close,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::End => "end",
            Self::Finish => "finish",
            Self::Drain => "drain",
            Self::Error => "error",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// An emitted event, borrowed for the duration of the listener call.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// See [`EventKind::Data`].
    Data(&'a Chunk),
    /// See [`EventKind::End`].
    End,
    /// See [`EventKind::Finish`].
    Finish,
    /// See [`EventKind::Drain`].
    Drain,
    /// See [`EventKind::Error`].
    Error(&'a StreamError),
    /// See [`EventKind::Close`].
    Close,
}

impl Event<'_> {
    /// The kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::End => EventKind::End,
            Self::Finish => EventKind::Finish,
            Self::Drain => EventKind::Drain,
            Self::Error(_) => EventKind::Error,
            Self::Close => EventKind::Close,
        }
    }
}

/// Identifies a registered listener for [`PushStream::off`](super::PushStream::off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Shared listener callback.
pub type ListenerFn = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

struct Entry {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    callback: ListenerFn,
}

/// Registered listeners, in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Listeners {
    pub(crate) fn add(&mut self, kind: EventKind, once: bool, callback: ListenerFn) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push(Entry {
            id,
            kind,
            once,
            callback,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    /// Returns the callbacks to invoke for `kind`, dropping `once` entries.
    ///
    /// Callers invoke the snapshot after releasing the lock, so a listener may
    /// freely register or remove listeners.
    pub(crate) fn snapshot(&mut self, kind: EventKind) -> SmallVec<[ListenerFn; 4]> {
        let callbacks = self
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        self.entries.retain(|entry| !(entry.once && entry.kind == kind));
        callbacks
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
