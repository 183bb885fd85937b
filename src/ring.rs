//! Fixed-size time-stamped ring with a "since T" read.

/// Default slot count for the engine's log ring.
pub const RING_SLOTS: usize = 1024;

/// A fixed-size append-only circular buffer of `(timestamp, entry)` pairs.
///
/// The slot count is held in `size` and every index computation is modulo
/// `size`, not the backing vector's length. The two coincide for rings
/// built through the public constructors; the separation is kept so the
/// indexing base can diverge from the allocation if it ever has to.
/// Empty slots carry timestamp 0, which sorts before any real `t`.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    size: usize,
    slots: Vec<(u64, T)>,
    /// Next slot to write; the oldest entry once the ring has wrapped.
    write: usize,
    wrapped: bool,
}

impl<T: Clone + Default> Ring<T> {
    pub fn new() -> Self {
        Self::with_size(RING_SLOTS)
    }

    pub fn with_size(size: usize) -> Self {
        assert!(size > 0, "ring must have at least one slot");
        Self {
            size,
            slots: vec![(0, T::default()); size],
            write: 0,
            wrapped: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Append an entry, overwriting the oldest once full.
    pub fn append(&mut self, ts_ms: u64, entry: T) {
        self.slots[self.write % self.size] = (ts_ms, entry);
        self.write = (self.write + 1) % self.size;
        if self.write == 0 {
            self.wrapped = true;
        }
    }

    /// Entries with timestamp strictly after `t`, in chronological order.
    ///
    /// Walks backward from the most recent slot and stops at the write
    /// position so a wrapped ring is never read twice.
    pub fn read_since(&self, t: u64) -> Vec<(u64, T)> {
        let mut out = Vec::new();
        let filled = if self.wrapped { self.size } else { self.write };
        for back in 1..=filled {
            let idx = (self.write + self.size - back) % self.size;
            let (ts, entry) = &self.slots[idx];
            if *ts > t {
                out.push((*ts, entry.clone()));
            } else {
                break;
            }
        }
        out.reverse();
        out
    }
}

impl<T: Clone + Default> Default for Ring<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_since_on_partial_ring() {
        let mut ring = Ring::with_size(8);
        for t in 1..=3u64 {
            ring.append(t, format!("line{}", t));
        }
        let out = ring.read_since(1);
        assert_eq!(
            out,
            vec![(2, "line2".to_string()), (3, "line3".to_string())]
        );
        assert!(ring.read_since(3).is_empty());
        assert_eq!(ring.read_since(0).len(), 3);
    }

    #[test]
    fn overwrite_keeps_newest_size_entries() {
        let n = 8;
        let mut ring = Ring::with_size(n);
        // n + k appends: only the newest n survive
        for t in 1..=(n as u64 + 5) {
            ring.append(t, format!("line{}", t));
        }
        let out = ring.read_since(0);
        assert_eq!(out.len(), n);
        assert_eq!(out.first().unwrap().0, 6);
        assert_eq!(out.last().unwrap().0, n as u64 + 5);
        // ascending timestamps
        assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn empty_slots_never_match() {
        let ring: Ring<String> = Ring::with_size(4);
        assert!(ring.read_since(0).is_empty());
    }

    #[test]
    fn read_stops_at_write_position() {
        let mut ring = Ring::with_size(4);
        for t in 1..=6u64 {
            ring.append(t, t);
        }
        // slots hold 3,4,5,6; asking since 0 must not loop past the writer
        let out = ring.read_since(0);
        assert_eq!(out.iter().map(|e| e.0).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }
}
