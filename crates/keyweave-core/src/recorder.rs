//! Convert recorded input events into script text.
//!
//! A recording is a JSON-lines stream, one [`RecordedEvent`] per line,
//! with timestamps in seconds since the recording started:
//!
//! ```text
//! {"type":"mouse_move","at":0.0,"x":10,"y":20}
//! {"type":"key_press","at":0.4,"key":"a","duration":0.12}
//! {"type":"mouse_click","at":1.5,"x":10,"y":20,"button":"left"}
//! ```
//!
//! [`ScriptRecorder::generate_script`] turns the accepted events into
//! `move`, `press`, `click` and `wait` lines.

use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::driver::MouseButton;

/// Mouse moves closer together than this are dropped.
pub const MOVE_THROTTLE_SECS: f64 = 0.5;

/// Gaps at or below this are not worth a `wait` line.
pub const MIN_WAIT_SECS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedEvent {
    KeyPress { at: f64, key: String, duration: f64 },
    MouseClick { at: f64, x: i32, y: i32, button: MouseButton },
    MouseMove { at: f64, x: i32, y: i32 },
}

impl RecordedEvent {
    pub fn at(&self) -> f64 {
        match self {
            RecordedEvent::KeyPress { at, .. }
            | RecordedEvent::MouseClick { at, .. }
            | RecordedEvent::MouseMove { at, .. } => *at,
        }
    }

    fn to_command(&self) -> String {
        match self {
            RecordedEvent::KeyPress { key, duration, .. } => {
                format!("press,{},{:.2}", key, duration)
            }
            RecordedEvent::MouseClick { x, y, button, .. } => {
                format!("click,{},{},{}", x, y, button)
            }
            RecordedEvent::MouseMove { x, y, .. } => format!("move,{},{}", x, y),
        }
    }
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid event on line {line}: {source}")]
    InvalidEvent {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Collects events while recording and renders them as a script.
#[derive(Debug, Clone)]
pub struct ScriptRecorder {
    events: Vec<RecordedEvent>,
    last_move_at: Option<f64>,
    recording: bool,
}

impl Default for ScriptRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRecorder {
    /// A recorder that is already accepting events.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            last_move_at: None,
            recording: true,
        }
    }

    /// Offer an event. Returns whether it was kept.
    pub fn record(&mut self, event: RecordedEvent) -> bool {
        if !self.recording {
            return false;
        }
        if let RecordedEvent::MouseMove { at, .. } = event {
            if self
                .last_move_at
                .is_some_and(|last| at - last < MOVE_THROTTLE_SECS)
            {
                debug!(at, "mouse move throttled");
                return false;
            }
            self.last_move_at = Some(at);
        }
        self.events.push(event);
        true
    }

    /// Stop accepting events and return what was kept.
    pub fn stop(&mut self) -> &[RecordedEvent] {
        self.recording = false;
        &self.events
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.last_move_at = None;
    }

    pub fn generate_script(&self) -> String {
        if self.events.is_empty() {
            return "# No actions recorded".to_string();
        }

        let mut lines = vec![
            "# Recorded macro".to_string(),
            format!("# Total actions: {}", self.events.len()),
            String::new(),
        ];
        let mut previous = 0.0;
        for event in &self.events {
            let gap = event.at() - previous;
            if gap > MIN_WAIT_SECS {
                lines.push(format!("wait,{:.2}", gap));
            }
            lines.push(event.to_command());
            previous = event.at();
        }
        lines.join("\n")
    }

    /// Feed every event of a JSON-lines recording through a fresh recorder.
    /// Blank lines are skipped.
    pub fn from_jsonl(content: &str) -> Result<Self, RecorderError> {
        let mut recorder = Self::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: RecordedEvent =
                serde_json::from_str(line).map_err(|source| RecorderError::InvalidEvent {
                    line: index + 1,
                    source,
                })?;
            recorder.record(event);
        }
        recorder.stop();
        Ok(recorder)
    }

    pub fn convert_file(path: &Path) -> Result<String, RecorderError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_jsonl(&content)?.generate_script())
    }

    pub fn convert_stdin() -> Result<String, RecorderError> {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content)?;
        Ok(Self::from_jsonl(&content)?.generate_script())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(at: f64, key: &str, duration: f64) -> RecordedEvent {
        RecordedEvent::KeyPress {
            at,
            key: key.into(),
            duration,
        }
    }

    fn mv(at: f64, x: i32, y: i32) -> RecordedEvent {
        RecordedEvent::MouseMove { at, x, y }
    }

    #[test]
    fn test_empty_recording() {
        assert_eq!(ScriptRecorder::new().generate_script(), "# No actions recorded");
    }

    #[test]
    fn test_generate_script_with_waits() {
        let mut rec = ScriptRecorder::new();
        rec.record(key(0.05, "a", 0.123));
        rec.record(RecordedEvent::MouseClick {
            at: 1.0,
            x: 100,
            y: 200,
            button: MouseButton::Right,
        });
        rec.record(mv(1.08, 5, 6));

        let expected = "# Recorded macro\n\
                        # Total actions: 3\n\
                        \n\
                        press,a,0.12\n\
                        wait,0.95\n\
                        click,100,200,right\n\
                        move,5,6";
        assert_eq!(rec.generate_script(), expected);
    }

    #[test]
    fn test_mouse_moves_are_throttled() {
        let mut rec = ScriptRecorder::new();
        assert!(rec.record(mv(0.0, 1, 1)));
        assert!(!rec.record(mv(0.3, 2, 2)));
        assert!(rec.record(key(0.4, "b", 0.1)));
        assert!(rec.record(mv(0.6, 3, 3)));
        assert_eq!(rec.events().len(), 3);
    }

    #[test]
    fn test_clear_forgets_events_and_move_throttle() {
        let mut rec = ScriptRecorder::new();
        rec.record(key(0.0, "a", 0.1));
        assert!(rec.record(mv(0.1, 1, 1)));
        rec.clear();
        assert!(rec.events().is_empty());
        assert!(rec.record(mv(0.2, 2, 2)));
        assert_eq!(rec.events(), &[mv(0.2, 2, 2)]);
    }

    #[test]
    fn test_events_after_stop_are_ignored() {
        let mut rec = ScriptRecorder::new();
        rec.record(key(0.0, "x", 0.1));
        assert_eq!(rec.stop().len(), 1);
        assert!(!rec.is_recording());
        assert!(!rec.record(key(1.0, "y", 0.1)));
        assert_eq!(rec.events().len(), 1);
    }

    #[test]
    fn test_from_jsonl() {
        let input = r#"
{"type":"mouse_move","at":0.0,"x":10,"y":20}
{"type":"key_press","at":0.5,"key":"enter","duration":0.2}

{"type":"mouse_click","at":0.55,"x":10,"y":20,"button":"left"}
"#;
        let rec = ScriptRecorder::from_jsonl(input).unwrap();
        let script = rec.generate_script();
        assert!(script.contains("move,10,20\nwait,0.50\npress,enter,0.20\nclick,10,20,left"));
    }

    #[test]
    fn test_from_jsonl_reports_bad_line() {
        let input = "{\"type\":\"mouse_move\",\"at\":0,\"x\":1,\"y\":1}\n{\"type\":\"teleport\"}";
        let err = ScriptRecorder::from_jsonl(input).unwrap_err();
        assert!(matches!(err, RecorderError::InvalidEvent { line: 2, .. }));
    }
}
