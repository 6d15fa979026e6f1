use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// VID carried by unused trailing result slots.
pub const SENTINEL_VID: i64 = -1;

/// One search hit. Slots past the hit count keep `vid == SENTINEL_VID`.
#[derive(Clone, Debug)]
pub struct ResultSlot {
    pub vid: i64,
    pub distance: f32,
    pub metadata: Option<Vec<u8>>,
    pub vector: Option<Vec<f32>>,
}

impl ResultSlot {
    fn sentinel() -> Self {
        Self {
            vid: SENTINEL_VID,
            distance: f32::MAX,
            metadata: None,
            vector: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.vid < 0
    }
}

/// Fixed-capacity ordered result set: filled slots ascending by
/// distance, sentinel slots trailing.
#[derive(Clone, Debug)]
pub struct QueryResult {
    slots: Vec<ResultSlot>,
}

impl QueryResult {
    pub(crate) fn with_capacity(batch_capacity: usize) -> Self {
        Self {
            slots: vec![ResultSlot::sentinel(); batch_capacity],
        }
    }

    pub(crate) fn fill(&mut self, hits: impl IntoIterator<Item = ResultSlot>) {
        for (slot, hit) in self.slots.iter_mut().zip(hits) {
            *slot = hit;
        }
    }

    pub fn slots(&self) -> &[ResultSlot] {
        &self.slots
    }

    /// Number of non-sentinel slots.
    pub fn result_count(&self) -> usize {
        self.slots.iter().take_while(|s| !s.is_sentinel()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultSlot> {
        self.slots.iter().take_while(|s| !s.is_sentinel())
    }
}

/// Max-heap entry so the current worst hit sits on top.
#[derive(Clone, Copy, Debug)]
struct HeapHit {
    distance: f32,
    vid: i64,
}

impl PartialEq for HeapHit {
    fn eq(&self, other: &Self) -> bool {
        self.vid == other.vid && self.distance == other.distance
    }
}

impl Eq for HeapHit {}

impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            // equal distances: the larger vid is the "worse" hit, so the
            // final ascending order breaks ties by ascending vid
            .then_with(|| self.vid.cmp(&other.vid))
    }
}

/// Bounded top-k collector. A candidate displaces the current worst hit
/// only when strictly better under the (distance, vid) order.
pub(crate) struct TopK {
    capacity: usize,
    heap: BinaryHeap<HeapHit>,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            heap: BinaryHeap::with_capacity(capacity.max(1) + 1),
        }
    }

    /// Returns true when the candidate was kept.
    pub fn push(&mut self, vid: i64, distance: f32) -> bool {
        let hit = HeapHit { distance, vid };
        if self.heap.len() < self.capacity {
            self.heap.push(hit);
            return true;
        }
        let worst = self.heap.peek().copied().expect("non-empty at capacity");
        if hit.cmp(&worst) == Ordering::Less {
            self.heap.pop();
            self.heap.push(hit);
            return true;
        }
        false
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Distance of the current worst kept hit, if full.
    pub fn threshold(&self) -> Option<f32> {
        if self.is_full() {
            self.heap.peek().map(|h| h.distance)
        } else {
            None
        }
    }

    /// Drain into `(vid, distance)` ascending by (distance, vid).
    pub fn into_sorted(self) -> Vec<(i64, f32)> {
        let mut hits: Vec<HeapHit> = self.heap.into_vec();
        hits.sort_by(|a, b| a.cmp(b));
        hits.into_iter().map(|h| (h.vid, h.distance)).collect()
    }
}
