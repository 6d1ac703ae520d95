//! Shared occupancy state with atomic batch updates and snapshot reads.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spots::SpotId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotStatus {
    #[default]
    Empty,
    Occupied,
    Unknown,
}

impl SpotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SpotStatus::Empty => "empty",
            SpotStatus::Occupied => "occupied",
            SpotStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: SpotId,
    pub status: SpotStatus,
    pub plate: Option<String>,
}

impl Spot {
    fn empty(id: SpotId) -> Self {
        Self {
            id,
            status: SpotStatus::Empty,
            plate: None,
        }
    }
}

/// Point-in-time copy of the whole lot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub total: usize,
    pub available: usize,
    pub occupied: usize,
    pub spots: Vec<Spot>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OccupancySnapshot {
    pub fn spot(&self, id: SpotId) -> Option<&Spot> {
        self.spots.iter().find(|spot| spot.id == id)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialise occupancy snapshot")
    }
}

/// Requested state of one spot.
///
/// Deserialises from either `{"status": "occupied", "plate": "AB12CD"}` or a
/// bare status string such as `"occupied"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SpotUpdateWire")]
pub struct SpotUpdate {
    pub status: SpotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
}

impl SpotUpdate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn occupied(plate: Option<String>) -> Self {
        Self {
            status: SpotStatus::Occupied,
            plate,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpotUpdateWire {
    Status(SpotStatus),
    Entry {
        #[serde(default)]
        status: SpotStatus,
        #[serde(default)]
        plate: Option<String>,
    },
}

impl From<SpotUpdateWire> for SpotUpdate {
    fn from(wire: SpotUpdateWire) -> Self {
        match wire {
            SpotUpdateWire::Status(status) => Self {
                status,
                plate: None,
            },
            SpotUpdateWire::Entry { status, plate } => Self { status, plate },
        }
    }
}

pub type UpdateBatch = BTreeMap<SpotId, SpotUpdate>;

/// What a single [`OccupancyStore::update`] call did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub applied: usize,
    pub ignored: Vec<SpotId>,
    /// Spots whose status or plate differs from before the batch.
    pub changed: Vec<SpotId>,
    pub occupied: usize,
    pub available: usize,
}

struct LotState {
    spots: Vec<Spot>,
    occupied: usize,
    updated_at: Option<DateTime<Utc>>,
}

impl LotState {
    fn recount(&mut self) {
        self.occupied = self
            .spots
            .iter()
            .filter(|spot| spot.status == SpotStatus::Occupied)
            .count();
    }
}

/// Mutex-guarded table of `N` spots shared between the pipeline and readers.
pub struct OccupancyStore {
    total: usize,
    inner: Mutex<LotState>,
}

impl OccupancyStore {
    /// Create `total` spots, all empty.
    pub fn new(total: u32) -> Self {
        Self {
            total: total as usize,
            inner: Mutex::new(LotState {
                spots: (1..=total).map(Spot::empty).collect(),
                occupied: 0,
                updated_at: None,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn lock(&self) -> MutexGuard<'_, LotState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply every entry of `batch` under a single lock acquisition.
    ///
    /// Ids outside `1..=N` are ignored. A non-empty plate is stored, an
    /// occupied entry without a plate keeps the last known one, and any other
    /// status clears it.
    pub fn update(&self, batch: &UpdateBatch) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let mut state = self.lock();

        for (&id, update) in batch {
            let Some(spot) = index_of(id, self.total).map(|idx| &mut state.spots[idx]) else {
                summary.ignored.push(id);
                continue;
            };
            let before = (spot.status, spot.plate.clone());
            spot.status = update.status;
            match (update.status, update.plate.as_deref().map(str::trim)) {
                (SpotStatus::Occupied, Some(plate)) if !plate.is_empty() => {
                    spot.plate = Some(plate.to_string());
                }
                (SpotStatus::Occupied, _) => {}
                _ => spot.plate = None,
            }
            if before != (spot.status, spot.plate.clone()) {
                summary.changed.push(id);
            }
            summary.applied += 1;
        }

        state.recount();
        state.updated_at = Some(Utc::now());
        summary.occupied = state.occupied;
        summary.available = self.total - state.occupied;
        drop(state);

        metrics::gauge!("parking_spots_occupied").set(summary.occupied as f64);
        metrics::gauge!("parking_spots_available").set(summary.available as f64);
        if !summary.ignored.is_empty() {
            debug!("Ignored updates for unknown spots {:?}", summary.ignored);
        }
        summary
    }

    /// Parse an ingestion body keyed by spot id and apply it like [`update`].
    ///
    /// Keys that are not integers are treated like unknown ids.
    ///
    /// [`update`]: OccupancyStore::update
    pub fn update_json(&self, body: &str) -> Result<UpdateSummary> {
        let raw: BTreeMap<String, SpotUpdate> =
            serde_json::from_str(body).context("invalid occupancy update body")?;
        let mut batch = UpdateBatch::new();
        let mut unparsable = 0usize;
        for (key, update) in raw {
            match key.trim().parse::<SpotId>() {
                Ok(id) => {
                    batch.insert(id, update);
                }
                Err(_) => unparsable += 1,
            }
        }
        if unparsable > 0 {
            debug!("Skipped {unparsable} update entries with non-numeric spot ids");
        }
        Ok(self.update(&batch))
    }

    /// Independent deep copy of the current state.
    pub fn snapshot(&self) -> OccupancySnapshot {
        let state = self.lock();
        OccupancySnapshot {
            total: self.total,
            available: self.total - state.occupied,
            occupied: state.occupied,
            spots: state.spots.clone(),
            updated_at: state.updated_at,
        }
    }

    /// Status query consumed by external handlers.
    pub fn get_status(&self) -> OccupancySnapshot {
        self.snapshot()
    }

    /// One spot; ids outside `1..=N` report `Unknown`.
    pub fn get_spot(&self, id: SpotId) -> Spot {
        match index_of(id, self.total) {
            Some(idx) => self.lock().spots[idx].clone(),
            None => Spot {
                id,
                status: SpotStatus::Unknown,
                plate: None,
            },
        }
    }
}

fn index_of(id: SpotId, total: usize) -> Option<usize> {
    let idx = (id as usize).checked_sub(1)?;
    (idx < total).then_some(idx)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn batch(entries: &[(SpotId, SpotUpdate)]) -> UpdateBatch {
        entries.iter().cloned().collect()
    }

    fn occupied(plate: &str) -> SpotUpdate {
        SpotUpdate::occupied(Some(plate.to_string()))
    }

    #[test]
    fn starts_all_empty() {
        let store = OccupancyStore::new(12);
        let snap = store.snapshot();
        assert_eq!((snap.total, snap.available, snap.occupied), (12, 12, 0));
        assert_eq!(snap.spots.len(), 12);
        assert!(snap.spots.iter().all(|s| s.status == SpotStatus::Empty));
        assert!(snap.updated_at.is_none());
        assert_eq!(
            snap.spots.iter().map(|s| s.id).collect::<Vec<_>>(),
            (1..=12).collect::<Vec<_>>()
        );
    }

    #[test]
    fn counts_always_sum_to_total() {
        let store = OccupancyStore::new(12);
        let batches = [
            batch(&[(1, occupied("AB12CD")), (2, SpotUpdate::occupied(None))]),
            batch(&[(1, SpotUpdate::empty())]),
            batch(&[(
                5,
                SpotUpdate {
                    status: SpotStatus::Unknown,
                    plate: None,
                },
            )]),
            batch(&[(3, occupied("X1Y2")), (4, occupied("Z9Z9")), (12, occupied("Q1Q1"))]),
        ];
        for b in &batches {
            let summary = store.update(b);
            let snap = store.snapshot();
            assert_eq!(snap.available + snap.occupied, snap.total);
            assert_eq!(summary.available + summary.occupied, 12);
        }
        assert_eq!(store.snapshot().occupied, 4);
    }

    #[test]
    fn out_of_range_ids_are_ignored() {
        let store = OccupancyStore::new(12);
        let summary = store.update(&batch(&[
            (0, occupied("AB12CD")),
            (13, occupied("AB12CD")),
            (7, occupied("CD34EF")),
        ]));
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.ignored, vec![0, 13]);
        let snap = store.snapshot();
        assert_eq!(snap.occupied, 1);
        assert_eq!(snap.spot(7).unwrap().plate.as_deref(), Some("CD34EF"));
    }

    #[test]
    fn get_spot_outside_range_is_unknown() {
        let store = OccupancyStore::new(12);
        assert_eq!(store.get_spot(0).status, SpotStatus::Unknown);
        assert_eq!(store.get_spot(99).status, SpotStatus::Unknown);
        assert_eq!(store.get_spot(12).status, SpotStatus::Empty);
    }

    #[test]
    fn empty_clears_plate_and_occupied_without_plate_keeps_it() {
        let store = OccupancyStore::new(12);
        store.update(&batch(&[(4, occupied("AB12CD"))]));
        store.update(&batch(&[(4, SpotUpdate::occupied(None))]));
        assert_eq!(store.get_spot(4).plate.as_deref(), Some("AB12CD"));

        let summary = store.update(&batch(&[(4, SpotUpdate::empty())]));
        assert_eq!(summary.changed, vec![4]);
        let spot = store.get_spot(4);
        assert_eq!(spot.status, SpotStatus::Empty);
        assert_eq!(spot.plate, None);
    }

    #[test]
    fn snapshot_is_detached_from_later_updates() {
        let store = OccupancyStore::new(12);
        let before = store.snapshot();
        store.update(&batch(&[(1, occupied("AB12CD"))]));
        assert_eq!(before.spot(1).unwrap().status, SpotStatus::Empty);
        assert_eq!(before.occupied, 0);
    }

    #[test]
    fn readers_never_observe_partial_batches() {
        let store = Arc::new(OccupancyStore::new(12));
        let all_occupied: UpdateBatch = (1..=12).map(|id| (id, occupied("AB12CD"))).collect();
        let all_empty: UpdateBatch = (1..=12).map(|id| (id, SpotUpdate::empty())).collect();

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    if i % 2 == 0 {
                        store.update(&all_occupied);
                    } else {
                        store.update(&all_empty);
                    }
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snap = store.snapshot();
                        let occupied = snap
                            .spots
                            .iter()
                            .filter(|s| s.status == SpotStatus::Occupied)
                            .count();
                        assert!(occupied == 0 || occupied == 12);
                        assert_eq!(snap.occupied, occupied);
                        assert_eq!(snap.available + snap.occupied, 12);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn json_body_accepts_objects_and_bare_strings() {
        let store = OccupancyStore::new(12);
        let summary = store
            .update_json(
                r#"{
                    "1": {"status": "occupied", "plate": "AB12CD"},
                    "2": "occupied",
                    "3": {"plate": "IGNORED1"},
                    "spot": "occupied",
                    "42": "occupied"
                }"#,
            )
            .unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.ignored, vec![42]);

        let snap = store.get_status();
        assert_eq!(snap.occupied, 2);
        assert_eq!(snap.spot(1).unwrap().plate.as_deref(), Some("AB12CD"));
        assert_eq!(snap.spot(2).unwrap().plate, None);
        assert_eq!(snap.spot(3).unwrap().status, SpotStatus::Empty);
        assert_eq!(snap.spot(3).unwrap().plate, None);
    }

    #[test]
    fn malformed_json_is_rejected_without_applying() {
        let store = OccupancyStore::new(12);
        assert!(store.update_json("{\"1\": \"parked\"}").is_err());
        assert!(store.update_json("not json").is_err());
        assert!(store.snapshot().updated_at.is_none());
    }

    #[test]
    fn status_serialises_to_documented_shape() {
        let store = OccupancyStore::new(2);
        store.update(&batch(&[(2, occupied("AB12CD"))]));
        let value: serde_json::Value = serde_json::from_str(&store.get_status().to_json().unwrap())
            .unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["available"], 1);
        assert_eq!(value["occupied"], 1);
        assert_eq!(value["spots"][0]["status"], "empty");
        assert!(value["spots"][0]["plate"].is_null());
        assert_eq!(value["spots"][1]["plate"], "AB12CD");
        assert!(value["updated_at"].is_string());
    }
}
