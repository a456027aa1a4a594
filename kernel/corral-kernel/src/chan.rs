//! Kernel byte channels.
//!
//! The model's one real blocking device: a FIFO byte pipe a reader can
//! block on. Gives the async-syscall contract something honest to
//! suspend against, so abort and timeout scenarios exercise the same
//! paths a driver would.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use corral_core::SpinLock;

/// A pending blocked reader, ordered FIFO.
pub(crate) struct ChanReader {
    /// Syscall identity (its address word).
    pub(crate) addr: u64,
    /// How many bytes the reader asked for.
    pub(crate) nbytes: usize,
}

/// One byte channel.
pub(crate) struct Chan {
    state: SpinLock<ChanState>,
}

struct ChanState {
    bytes: VecDeque<u8>,
    readers: VecDeque<ChanReader>,
}

impl Chan {
    fn new() -> Self {
        Self {
            state: SpinLock::new(ChanState {
                bytes: VecDeque::new(),
                readers: VecDeque::new(),
            }),
        }
    }

    /// Tries to satisfy a read immediately. Returns the bytes, or `None`
    /// if the channel is empty (the caller blocks).
    pub(crate) fn read_or_enqueue(&self, reader: ChanReader) -> Option<Vec<u8>> {
        let mut st = self.state.lock();
        if st.bytes.is_empty() {
            st.readers.push_back(reader);
            return None;
        }
        let n = reader.nbytes.min(st.bytes.len());
        Some(st.bytes.drain(..n).collect())
    }

    /// Appends bytes; returns the blocked readers that can now be
    /// served, in FIFO order, paired with their data.
    pub(crate) fn write(&self, data: &[u8]) -> Vec<(u64, Vec<u8>)> {
        let mut st = self.state.lock();
        st.bytes.extend(data.iter().copied());
        let mut served = Vec::new();
        while !st.bytes.is_empty() {
            let Some(reader) = st.readers.pop_front() else {
                break;
            };
            let n = reader.nbytes.min(st.bytes.len());
            let bytes: Vec<u8> = st.bytes.drain(..n).collect();
            served.push((reader.addr, bytes));
        }
        served
    }

    /// Drops a blocked reader (abort path). Returns whether it was
    /// still queued.
    pub(crate) fn cancel_reader(&self, addr: u64) -> bool {
        let mut st = self.state.lock();
        let before = st.readers.len();
        st.readers.retain(|r| r.addr != addr);
        st.readers.len() != before
    }

    /// Puts bytes back at the head of the buffer (a served reader turned
    /// out to be aborted).
    pub(crate) fn unread(&self, bytes: &[u8]) {
        let mut st = self.state.lock();
        for &b in bytes.iter().rev() {
            st.bytes.push_front(b);
        }
    }
}

/// Machine-wide channel namespace.
#[derive(Default)]
pub(crate) struct ChanTable {
    chans: SpinLock<BTreeMap<u64, Arc<Chan>>>,
    next_id: AtomicU64,
}

impl ChanTable {
    /// Creates a channel and returns its id.
    pub(crate) fn create(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.chans.lock().insert(id, Arc::new(Chan::new()));
        id
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<Chan>> {
        self.chans.lock().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_read_when_data_present() {
        let c = Chan::new();
        assert!(c.write(b"hello").is_empty());
        let got = c
            .read_or_enqueue(ChanReader { addr: 1, nbytes: 3 })
            .unwrap();
        assert_eq!(got, b"hel");
    }

    #[test]
    fn blocked_reader_served_by_write() {
        let c = Chan::new();
        assert!(c.read_or_enqueue(ChanReader { addr: 7, nbytes: 4 }).is_none());
        let served = c.write(b"abcdef");
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].0, 7);
        assert_eq!(served[0].1, b"abcd");
    }

    #[test]
    fn cancel_removes_blocked_reader() {
        let c = Chan::new();
        assert!(c.read_or_enqueue(ChanReader { addr: 9, nbytes: 1 }).is_none());
        assert!(c.cancel_reader(9));
        assert!(!c.cancel_reader(9));
        assert!(c.write(b"x").is_empty(), "cancelled reader must not be served");
    }
}
