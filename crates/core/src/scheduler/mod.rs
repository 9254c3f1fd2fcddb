use crate::{sink::OutboundBatch, timeline::CueSheet};

/// A jump larger than this is treated as a seek or loop and rebases the
/// scheduler. Smaller backward moves are jitter from the beat-fraction
/// estimate. Forward moves are allowed this much beyond the tick's delta.
const REWIND_THRESHOLD_BEATS: f64 = 1.0;

/// Fires the cues of the active sheet as the beat position advances.
///
/// Each tick covers `(mark, position]`, where `mark` is the furthest position
/// already covered. Consecutive windows never overlap and leave no gaps, so
/// every cue fires exactly once while the position moves forward.
#[derive(Debug, Default)]
pub struct CueScheduler {
    mark: Option<f64>,
}

impl CueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the covered range. The next tick starts a fresh window.
    pub fn rebase(&mut self) {
        self.mark = None;
    }

    pub fn high_water_mark(&self) -> Option<f64> {
        self.mark
    }

    /// Collects the cues between the previous tick and `position` into one
    /// batch. `delta_beats` is the beat distance covered since the previous
    /// tick; it only sizes the first window after a rebase.
    pub fn tick(&mut self, sheet: Option<&CueSheet>, position: f64, delta_beats: f64) -> OutboundBatch {
        let mut batch = OutboundBatch::new();
        let Some(sheet) = sheet else {
            self.mark = None;
            return batch;
        };

        let delta_beats = delta_beats.max(0.0);
        let fresh_start = position - delta_beats;
        let floor = match self.mark {
            None => fresh_start,
            Some(mark) if position + REWIND_THRESHOLD_BEATS < mark => {
                tracing::debug!(position, mark, "beat position jumped back, rebasing");
                fresh_start
            }
            Some(mark) if position - mark > REWIND_THRESHOLD_BEATS + delta_beats => {
                tracing::debug!(position, mark, "beat position jumped ahead, skipping");
                fresh_start
            }
            Some(mark) => mark,
        };

        for instant in sheet.instants_after(floor, position) {
            for event in &instant.events {
                batch.push_message(event.to_message());
            }
        }
        self.mark = Some(floor.max(position));

        if !batch.is_empty() {
            tracing::debug!(sheet = sheet.name(), position, fired = batch.len(), "cues fired");
        }
        batch
    }
}
