use serde::{Deserialize, Serialize};
use thiserror::Error;
use zone_core::{Observation, Point, TrackId};

/// One tracked detection as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub track_id: TrackId,
    /// `(x1, y1, x2, y2)` in frame pixels.
    pub bbox: [f64; 4],
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<i64>,
}

fn default_confidence() -> f32 {
    1.0
}

impl Detection {
    pub fn centroid(&self) -> Point {
        Observation::from_bbox(self.track_id, self.bbox).position
    }

    pub fn to_observation(&self) -> Observation {
        Observation::from_bbox(self.track_id, self.bbox)
    }
}

/// All tracked detections of one frame, one JSON object per line on the wire:
///
/// ```json
/// {"frame": 42, "timestamp_ms": 1700000000000, "detections": [{"track_id": 3, "bbox": [10, 20, 50, 120], "confidence": 0.91}]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Frame index as numbered by the tracker, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl ObservationBatch {
    /// Observations for detections at or above `min_confidence`.
    pub fn observations(&self, min_confidence: f32) -> Vec<Observation> {
        self.detections
            .iter()
            .filter(|d| d.confidence >= min_confidence)
            .map(Detection::to_observation)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to start tracker command {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open replay file {path:?}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read from source failed")]
    Read(#[from] std::io::Error),
    #[error("source stalled for {0} ms")]
    Stalled(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Parse one wire line. Blank lines yield `Ok(None)`.
pub fn parse_batch_line(line: &str) -> Result<Option<ObservationBatch>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}
