//! Script persistence: plain text files and the JSON envelope.
//!
//! A script on disk is either the raw script text or a JSON document of the
//! form
//!
//! ```json
//! {
//!   "version": "4.0",
//!   "speed": 1.5,
//!   "script": "echo,hello",
//!   "metadata": { "created_at": "...", "created_by": "...", "iterations": 3 }
//! }
//! ```
//!
//! Unknown metadata keys are preserved across a load/save cycle.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope version written by [`save_json`].
pub const FORMAT_VERSION: &str = "4.0";

const REQUIRED_FIELDS: [&str; 3] = ["version", "speed", "script"];

#[derive(Error, Debug)]
pub enum ScriptFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid script file: missing '{0}' field")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroFile {
    pub version: String,
    pub speed: f64,
    pub script: String,
    #[serde(default)]
    pub metadata: MacroMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Keys this version does not know about.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_iterations() -> u32 {
    1
}

impl Default for MacroMetadata {
    fn default() -> Self {
        Self {
            created_at: None,
            created_by: None,
            iterations: default_iterations(),
            extra: serde_json::Map::new(),
        }
    }
}

impl MacroFile {
    /// A fresh envelope stamped with the current time and this crate's
    /// version.
    pub fn new(script: impl Into<String>, speed: f64, iterations: u32) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            speed,
            script: script.into(),
            metadata: MacroMetadata {
                created_at: Some(Utc::now().to_rfc3339()),
                created_by: Some(format!("keyweave v{}", env!("CARGO_PKG_VERSION"))),
                iterations,
                extra: serde_json::Map::new(),
            },
        }
    }

    /// Parse an envelope, rejecting documents without the required keys.
    pub fn from_json(content: &str) -> Result<Self, ScriptFileError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        for field in REQUIRED_FIELDS {
            if value.get(field).is_none() {
                return Err(ScriptFileError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, ScriptFileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A script ready to parse, with the run parameters stored alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedScript {
    pub script: String,
    pub speed: f64,
    pub iterations: u32,
    pub format: ScriptFormat,
    pub metadata: MacroMetadata,
}

/// Decide how to read `path`.
///
/// A `.json` extension means JSON. Otherwise the content is sniffed: a JSON
/// object with a `version` key is an envelope, anything else is text.
pub fn detect_format(path: &Path) -> ScriptFormat {
    let is_json_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json_ext {
        return ScriptFormat::Json;
    }

    let sniffed = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .is_some_and(|v| v.get("version").is_some());
    if sniffed {
        ScriptFormat::Json
    } else {
        ScriptFormat::Text
    }
}

/// Load a script in either format.
pub fn load(path: &Path) -> Result<LoadedScript, ScriptFileError> {
    let format = detect_format(path);
    let content = std::fs::read_to_string(path)?;
    match format {
        ScriptFormat::Json => {
            let file = MacroFile::from_json(&content)?;
            Ok(LoadedScript {
                script: file.script,
                speed: file.speed,
                iterations: file.metadata.iterations,
                format,
                metadata: file.metadata,
            })
        }
        ScriptFormat::Text => Ok(LoadedScript {
            script: content,
            speed: 1.0,
            iterations: 1,
            format,
            metadata: MacroMetadata::default(),
        }),
    }
}

pub fn save_text(path: &Path, script: &str) -> Result<(), ScriptFileError> {
    std::fs::write(path, script)?;
    Ok(())
}

/// Write `file` as pretty-printed JSON.
pub fn save_json(path: &Path, file: &MacroFile) -> Result<(), ScriptFileError> {
    std::fs::write(path, file.to_json()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_extension_and_content() {
        let dir = tempfile::tempdir().unwrap();

        let by_ext = dir.path().join("macro.JSON");
        std::fs::write(&by_ext, "not even json").unwrap();
        assert_eq!(detect_format(&by_ext), ScriptFormat::Json);

        let sniffed = dir.path().join("macro.txt");
        std::fs::write(&sniffed, r#"{"version": "4.0", "speed": 1, "script": ""}"#).unwrap();
        assert_eq!(detect_format(&sniffed), ScriptFormat::Json);

        let object_without_version = dir.path().join("other.txt");
        std::fs::write(&object_without_version, r#"{"speed": 1}"#).unwrap();
        assert_eq!(detect_format(&object_without_version), ScriptFormat::Text);

        let text = dir.path().join("macro.kw");
        std::fs::write(&text, "echo,hi").unwrap();
        assert_eq!(detect_format(&text), ScriptFormat::Text);
    }

    #[test]
    fn test_load_text_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        save_text(&path, "loop,2\n  echo,x\nendloop").unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.format, ScriptFormat::Text);
        assert_eq!(loaded.speed, 1.0);
        assert_eq!(loaded.iterations, 1);
        assert!(loaded.script.starts_with("loop,2"));
    }

    #[test]
    fn test_json_save_then_load_keeps_run_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        save_json(&path, &MacroFile::new("echo,hi", 2.5, 3)).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.format, ScriptFormat::Json);
        assert_eq!(loaded.script, "echo,hi");
        assert_eq!(loaded.speed, 2.5);
        assert_eq!(loaded.iterations, 3);
        assert!(loaded
            .metadata
            .created_by
            .as_deref()
            .is_some_and(|by| by.starts_with("keyweave")));
    }

    #[test]
    fn test_missing_required_field() {
        let err = MacroFile::from_json(r#"{"version": "4.0", "script": "echo,x"}"#).unwrap_err();
        assert!(matches!(err, ScriptFileError::MissingField("speed")));
        assert_eq!(
            err.to_string(),
            "invalid script file: missing 'speed' field"
        );
    }

    #[test]
    fn test_unknown_metadata_survives() {
        let json = r#"{
            "version": "4.0",
            "speed": 1.0,
            "script": "echo,x",
            "metadata": {"created_by": "Macro Builder v4.0", "author": "sam"}
        }"#;
        let file = MacroFile::from_json(json).unwrap();
        assert_eq!(file.metadata.iterations, 1);
        assert_eq!(
            file.metadata.extra.get("author"),
            Some(&serde_json::Value::from("sam"))
        );
        let again = MacroFile::from_json(&file.to_json().unwrap()).unwrap();
        assert_eq!(again, file);
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        assert!(matches!(
            MacroFile::from_json("{ nope"),
            Err(ScriptFileError::Json(_))
        ));
    }
}
