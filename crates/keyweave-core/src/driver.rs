//! Input driver trait for backend-agnostic keyboard/mouse injection.
//!
//! The executor never talks to the host platform directly. Everything that
//! touches real input devices or the screen goes through an [`InputDriver`]:
//! key and button transitions, pointer movement, scrolling, and the queries
//! behind system variables and `pixel` conditions.
//!
//! Higher-level gestures (press-and-hold, typing, dragging) are composed
//! from these primitives by [`commands`](crate::commands), so a backend only
//! has to provide the primitives.
//!
//! # Example
//!
//! ```
//! use keyweave_core::driver::{Key, MouseButton, SpecialKey};
//!
//! let combo = Key::parse_combo("ctrl+shift+s").unwrap();
//! assert_eq!(combo, vec![
//!     Key::Special(SpecialKey::Ctrl),
//!     Key::Special(SpecialKey::Shift),
//!     Key::Char('s'),
//! ]);
//! assert_eq!(MouseButton::from_name("rmc"), Some(MouseButton::Right));
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color::Rgb;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The backend attempted the operation and it failed.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The backend is not available or not connected.
    #[error("Not connected to input backend")]
    NotConnected,

    /// The backend cannot perform this kind of operation on this host.
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named, non-character keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialKey {
    Alt,
    AltL,
    AltR,
    AltGr,
    Backspace,
    CapsLock,
    Cmd,
    CmdL,
    CmdR,
    Ctrl,
    CtrlL,
    CtrlR,
    Delete,
    Down,
    End,
    Enter,
    Esc,
    F(u8),
    Home,
    Insert,
    Left,
    Menu,
    NumLock,
    PageDown,
    PageUp,
    Pause,
    PrintScreen,
    Right,
    ScrollLock,
    Shift,
    ShiftL,
    ShiftR,
    Space,
    Tab,
    Up,
}

impl SpecialKey {
    /// Look up a key by name. Matching is case-insensitive and accepts a
    /// few common aliases (`return`, `escape`, `control`, `win`).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "alt" | "option" => SpecialKey::Alt,
            "alt_l" => SpecialKey::AltL,
            "alt_r" => SpecialKey::AltR,
            "alt_gr" => SpecialKey::AltGr,
            "backspace" => SpecialKey::Backspace,
            "caps_lock" => SpecialKey::CapsLock,
            "cmd" | "win" | "super" | "meta" => SpecialKey::Cmd,
            "cmd_l" => SpecialKey::CmdL,
            "cmd_r" => SpecialKey::CmdR,
            "ctrl" | "control" => SpecialKey::Ctrl,
            "ctrl_l" => SpecialKey::CtrlL,
            "ctrl_r" => SpecialKey::CtrlR,
            "delete" | "del" => SpecialKey::Delete,
            "down" => SpecialKey::Down,
            "end" => SpecialKey::End,
            "enter" | "return" => SpecialKey::Enter,
            "esc" | "escape" => SpecialKey::Esc,
            "home" => SpecialKey::Home,
            "insert" => SpecialKey::Insert,
            "left" => SpecialKey::Left,
            "menu" => SpecialKey::Menu,
            "num_lock" => SpecialKey::NumLock,
            "page_down" | "pgdn" => SpecialKey::PageDown,
            "page_up" | "pgup" => SpecialKey::PageUp,
            "pause" => SpecialKey::Pause,
            "print_screen" => SpecialKey::PrintScreen,
            "right" => SpecialKey::Right,
            "scroll_lock" => SpecialKey::ScrollLock,
            "shift" => SpecialKey::Shift,
            "shift_l" => SpecialKey::ShiftL,
            "shift_r" => SpecialKey::ShiftR,
            "space" => SpecialKey::Space,
            "tab" => SpecialKey::Tab,
            "up" => SpecialKey::Up,
            other => {
                let n: u8 = other.strip_prefix('f')?.parse().ok()?;
                if (1..=20).contains(&n) {
                    SpecialKey::F(n)
                } else {
                    return None;
                }
            }
        };
        Some(key)
    }
}

impl fmt::Display for SpecialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpecialKey::F(n) => return write!(f, "f{}", n),
            SpecialKey::Alt => "alt",
            SpecialKey::AltL => "alt_l",
            SpecialKey::AltR => "alt_r",
            SpecialKey::AltGr => "alt_gr",
            SpecialKey::Backspace => "backspace",
            SpecialKey::CapsLock => "caps_lock",
            SpecialKey::Cmd => "cmd",
            SpecialKey::CmdL => "cmd_l",
            SpecialKey::CmdR => "cmd_r",
            SpecialKey::Ctrl => "ctrl",
            SpecialKey::CtrlL => "ctrl_l",
            SpecialKey::CtrlR => "ctrl_r",
            SpecialKey::Delete => "delete",
            SpecialKey::Down => "down",
            SpecialKey::End => "end",
            SpecialKey::Enter => "enter",
            SpecialKey::Esc => "esc",
            SpecialKey::Home => "home",
            SpecialKey::Insert => "insert",
            SpecialKey::Left => "left",
            SpecialKey::Menu => "menu",
            SpecialKey::NumLock => "num_lock",
            SpecialKey::PageDown => "page_down",
            SpecialKey::PageUp => "page_up",
            SpecialKey::Pause => "pause",
            SpecialKey::PrintScreen => "print_screen",
            SpecialKey::Right => "right",
            SpecialKey::ScrollLock => "scroll_lock",
            SpecialKey::Shift => "shift",
            SpecialKey::ShiftL => "shift_l",
            SpecialKey::ShiftR => "shift_r",
            SpecialKey::Space => "space",
            SpecialKey::Tab => "tab",
            SpecialKey::Up => "up",
        };
        f.write_str(name)
    }
}

/// A key on the keyboard: either a printable character or a named key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Char(char),
    Special(SpecialKey),
}

impl Key {
    /// Parse a single key name. A single character is always a literal
    /// key; anything longer must be a known [`SpecialKey`] name.
    pub fn parse(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(Key::Char(c)),
            (Some(_), Some(_)) => SpecialKey::from_name(name).map(Key::Special),
            (None, _) => None,
        }
    }

    /// Parse a `+`-joined combination such as `ctrl+c`.
    ///
    /// Returns the offending segment on failure.
    pub fn parse_combo(combo: &str) -> Result<Vec<Key>, String> {
        let combo = combo.trim();
        if combo == "+" {
            return Ok(vec![Key::Char('+')]);
        }
        combo
            .split('+')
            .map(str::trim)
            .map(|part| Key::parse(part).ok_or_else(|| part.to_string()))
            .collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{}", c),
            Key::Special(k) => write!(f, "{}", k),
        }
    }
}

/// A mouse button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// Accepts `left`/`right`/`middle` and the script shorthands
    /// `lmc`/`rmc`/`mmc`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" | "lmc" => Some(MouseButton::Left),
            "right" | "rmc" => Some(MouseButton::Right),
            "middle" | "mmc" => Some(MouseButton::Middle),
            _ => None,
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        })
    }
}

/// Trait for backend-agnostic input injection and screen sampling.
///
/// All methods are async so that backends which talk to a helper process or
/// a remote host can be awaited without blocking the run loop.
#[async_trait]
pub trait InputDriver: Send + Sync {
    /// Press a key without releasing it.
    async fn key_down(&self, key: Key) -> Result<(), DriverError>;

    /// Release a previously pressed key.
    async fn key_up(&self, key: Key) -> Result<(), DriverError>;

    /// Move the pointer to absolute screen coordinates.
    ///
    /// # Arguments
    ///
    /// * `x` - The x-coordinate in screen pixels
    /// * `y` - The y-coordinate in screen pixels
    async fn move_pointer(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn button_down(&self, button: MouseButton) -> Result<(), DriverError>;

    async fn button_up(&self, button: MouseButton) -> Result<(), DriverError>;

    /// Scroll the wheel. Positive `dy` scrolls up.
    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), DriverError>;

    /// Current pointer position.
    async fn pointer_position(&self) -> Result<(i32, i32), DriverError>;

    /// Screen dimensions in pixels. Headless hosts return
    /// [`DriverError::Unsupported`].
    async fn screen_size(&self) -> Result<(u32, u32), DriverError>;

    /// Colour of the screen pixel at `(x, y)`.
    async fn pixel_color(&self, x: i32, y: i32) -> Result<Rgb, DriverError>;
}
