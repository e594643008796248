use std::{
    fmt,
    io::Write,
    net::{Shutdown, TcpStream},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{trace, warn};

use shared::TransportError;

/// Identity of one accepted connection. Never reused, unlike slot indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ConnId,
    pub slot: usize,
}

struct Entry<W> {
    id: ConnId,
    conn: W,
}

struct Slots<W> {
    entries: Vec<Option<Entry<W>>>,
    count: usize,
    next_id: u64,
}

/// Lets the registry cut a connection off so its handler sees end of stream.
pub trait Disconnect {
    fn disconnect(&self);
}

impl Disconnect for TcpStream {
    fn disconnect(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Fixed-capacity set of connections that receive relayed frames.
pub struct BroadcastRegistry<W> {
    slots: Mutex<Slots<W>>,
    capacity: usize,
}

impl<W: Write + Disconnect> BroadcastRegistry<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: (0..capacity).map(|_| None).collect(),
                count: 0,
                next_id: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<W>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the first free slot for `conn`. On `RegistryFull` `conn` is
    /// dropped and the caller must close the connection it came from.
    pub fn register(&self, conn: W) -> Result<Registration, TransportError> {
        let mut slots = self.lock();
        let Some(slot) = slots.entries.iter().position(Option::is_none) else {
            return Err(TransportError::RegistryFull {
                capacity: self.capacity,
            });
        };

        let id = ConnId(slots.next_id);
        slots.next_id += 1;
        slots.entries[slot] = Some(Entry { id, conn });
        slots.count += 1;

        Ok(Registration { id, slot })
    }

    /// Writes `frame` plus a newline to every connection but `exclude`.
    /// Returns how many connections accepted the write.
    ///
    /// A connection whose write fails may hold a partial line, so it is
    /// disconnected and dropped from the registry.
    pub fn broadcast(&self, frame: &[u8], exclude: Option<ConnId>) -> usize {
        let mut line = Vec::with_capacity(frame.len() + 1);
        line.extend_from_slice(frame);
        line.push(b'\n');

        let mut slots = self.lock();
        let mut delivered = 0;
        let mut evicted = 0;
        for slot in slots.entries.iter_mut() {
            let Some(entry) = slot else { continue };
            if Some(entry.id) == exclude {
                continue;
            }
            match entry.conn.write_all(&line).and_then(|()| entry.conn.flush()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Relaying to client {} failed, dropping it: {e}", entry.id);
                    entry.conn.disconnect();
                    *slot = None;
                    evicted += 1;
                }
            }
        }
        slots.count -= evicted;
        trace!("Relayed {} bytes to {delivered} clients", frame.len());
        delivered
    }

    /// Frees the slot held by `id`. Returns `false` if it was already gone.
    pub fn unregister(&self, id: ConnId) -> bool {
        let mut slots = self.lock();
        let found = slots
            .entries
            .iter_mut()
            .find(|e| e.as_ref().is_some_and(|e| e.id == id));
        match found {
            Some(entry) => {
                *entry = None;
                slots.count -= 1;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().entries.iter().flatten().any(|e| e.id == id)
    }

    /// Cuts every registered connection off so each handler sees end of
    /// stream. Slots are freed by the handlers as they exit.
    pub fn disconnect_all(&self) {
        for entry in self.lock().entries.iter().flatten() {
            entry.conn.disconnect();
        }
    }
}
