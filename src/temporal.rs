//! Temporal confirmation and spatial deduplication.
//!
//! Both structures are strictly per-worker state: a detector owns one
//! [`TemporalBuffer`] and one [`DedupRing`] per output class of interest,
//! never shared and never locked.
//!
//! Confirmation thins false positives (a detection must recur across
//! frames before it is believed); dedup thins repeated reports of the same
//! real object (one event per grid cell per window).

use std::collections::VecDeque;

use sha1::{Digest, Sha1};

use crate::geometry::{iou, BBox};

/// A detection pinned to the frame it was observed on.
#[derive(Clone, Debug)]
pub struct TemporalDetection {
    pub label: String,
    pub bbox: BBox,
    pub conf: f32,
    pub frame_index: u64,
}

/// Bounded ring of recent detections for one camera.
#[derive(Debug)]
pub struct TemporalBuffer {
    window: usize,
    entries: VecDeque<TemporalDetection>,
}

impl TemporalBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            entries: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of held entries with the same label and IoU >= threshold
    /// against the query box.
    pub fn count_similar(&self, label: &str, bbox: &BBox, iou_threshold: f32) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.label == label && iou(&entry.bbox, bbox) >= iou_threshold)
            .count()
    }

    fn push(&mut self, entry: TemporalDetection) {
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Count-then-append confirmation.
    ///
    /// The new observation is compared against the buffer as it stood
    /// *before* this call, then appended; confirmation holds when the new
    /// entry plus its prior matches reach `min_confirmations`. Appending
    /// first would make the first confirmation fire one frame early.
    pub fn confirm(
        &mut self,
        label: &str,
        bbox: &BBox,
        conf: f32,
        min_confirmations: usize,
        iou_threshold: f32,
        frame_index: u64,
    ) -> bool {
        let prior = self.count_similar(label, bbox, iou_threshold);
        self.push(TemporalDetection {
            label: label.to_string(),
            bbox: *bbox,
            conf,
            frame_index,
        });
        prior + 1 >= min_confirmations
    }
}

/// Quantise a box centre onto the dedup grid.
pub fn grid_cell(bbox: &BBox, grid_size: u32) -> (i64, i64) {
    let grid = grid_size.max(1) as f32;
    let [cx, cy] = bbox.center();
    ((cx / grid).floor() as i64, (cy / grid).floor() as i64)
}

/// Hash a detection for dedup: key (label or plate text) plus grid cell.
/// Truncated hex digest; only equality matters.
pub fn detection_hash(key: &str, bbox: &BBox, grid_size: u32) -> String {
    let (gx, gy) = grid_cell(bbox, grid_size);
    let digest = Sha1::digest(format!("{}:{}_{}", key, gx, gy).as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Sliding ring of recently emitted detection hashes.
#[derive(Debug)]
pub struct DedupRing {
    window: u64,
    entries: VecDeque<(u64, String)>,
}

impl DedupRing {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            entries: VecDeque::with_capacity(window.max(1) as usize),
        }
    }

    /// Returns true when `hash` was emitted within the last `window`
    /// frames (the candidate is a duplicate and must be discarded).
    /// Non-duplicates are inserted, evicting the oldest entry at capacity.
    pub fn is_duplicate(&mut self, frame_index: u64, hash: &str) -> bool {
        let duplicate = self.entries.iter().any(|(held_frame, held_hash)| {
            held_hash == hash && frame_index.saturating_sub(*held_frame) < self.window
        });
        if duplicate {
            return true;
        }
        if self.entries.len() as u64 == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back((frame_index, hash.to_string()));
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
