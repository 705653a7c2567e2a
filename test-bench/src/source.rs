//! Inputs to the calibration loop.
//!
//! Marker detection runs out of process. The detector (or an operator) writes
//! one JSON object per line:
//!
//! ```text
//! {"event":"frame","size":{"width":640,"height":480},"markers":[{"marker_id":7,"center":[350.0,260.0],"corners":[[300,210],[400,210],[400,310],[300,310]]}]}
//! {"event":"grow_region"}
//! {"event":"stop"}
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use shared::observation::FrameDetections;
use thiserror::Error;
use tracing::warn;

/// One input to the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    /// Detector output for one captured frame
    Frame(FrameDetections),
    /// End the run
    Stop,
    /// Widen the acceptance window one step
    GrowRegion,
    /// Narrow the acceptance window one step
    ShrinkRegion,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Frame source I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame source failed: {0}")]
    Failed(String),
}

/// Something that yields detections and operator events.
pub trait FrameSource {
    /// Next event, or `Ok(None)` once the source is exhausted.
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        (**self).next_event()
    }
}

/// Reads [`SourceEvent`]s as JSON lines. Blank and malformed lines are skipped.
pub struct JsonLinesSource<R> {
    reader: R,
    line_number: usize,
    skipped: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            skipped: 0,
        }
    }

    /// Malformed lines seen so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl JsonLinesSource<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl JsonLinesSource<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self::new(io::stdin().lock())
    }
}

impl<R: BufRead> FrameSource for JsonLinesSource<R> {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping line {}: {e}", self.line_number);
                }
            }
        }
    }
}

/// Replays a fixed list of events.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    events: VecDeque<SourceEvent>,
}

impl ScriptedSource {
    pub fn new(events: impl IntoIterator<Item = SourceEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    pub fn push(&mut self, event: SourceEvent) {
        self.events.push_back(event);
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl FrameSource for ScriptedSource {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        Ok(self.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::image_size::ImageSize;
    use shared::observation::MarkerObservation;
    use std::io::Cursor;

    #[test]
    fn test_parses_event_stream() {
        let input = r#"
{"event":"frame","size":{"width":640,"height":480},"markers":[{"marker_id":7,"center":[350.0,260.0],"corners":[[300,210],[400,210],[400,310],[300,310]]}]}
{"event":"frame","size":{"width":640,"height":480}}
{"event":"grow_region"}
{"event":"shrink_region"}
{"event":"stop"}
"#;
        let mut source = JsonLinesSource::new(Cursor::new(input));

        match source.next_event().unwrap() {
            Some(SourceEvent::Frame(frame)) => {
                let marker = frame.primary().unwrap();
                assert_eq!(marker.marker_id, 7);
                assert_eq!(marker.center.x, 350.0);
                assert_eq!(marker.corner_distance(0, 1), 100.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            source.next_event().unwrap(),
            Some(SourceEvent::Frame(FrameDetections::empty(
                ImageSize::from_width_height(640, 480)
            )))
        );
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::GrowRegion));
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::ShrinkRegion));
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::Stop));
        assert_eq!(source.next_event().unwrap(), None);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let input = "garbage\n{\"event\":\"teleport\"}\n{\"event\":\"stop\"}\n";
        let mut source = JsonLinesSource::new(Cursor::new(input));
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::Stop));
        assert_eq!(source.skipped(), 2);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let frame = FrameDetections::new(
            ImageSize::from_width_height(320, 240),
            vec![MarkerObservation::square(3, 10.0, 20.0, 8.0)],
        );
        let line = serde_json::to_string(&SourceEvent::Frame(frame.clone())).unwrap();
        assert!(line.starts_with(r#"{"event":"frame""#));

        let mut source = JsonLinesSource::new(Cursor::new(line));
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::Frame(frame)));
    }

    #[test]
    fn test_scripted_source_drains_in_order() {
        let mut source = ScriptedSource::new([SourceEvent::GrowRegion, SourceEvent::Stop]);
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::GrowRegion));
        assert_eq!(source.next_event().unwrap(), Some(SourceEvent::Stop));
        assert_eq!(source.next_event().unwrap(), None);
    }
}
