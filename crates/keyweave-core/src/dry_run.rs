//! In-memory [`InputDriver`] that records instead of injecting.
//!
//! The dry-run driver never touches the host. It keeps a log of every
//! primitive it was asked to perform, tracks a virtual pointer, and answers
//! screen queries from configurable state. The CLI runs scripts against it,
//! and the test suites use it to observe what a script did.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::color::Rgb;
use crate::driver::{DriverError, InputDriver, Key, MouseButton};

/// A primitive recorded by [`DryRunDriver`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    KeyDown { key: Key },
    KeyUp { key: Key },
    Move { x: i32, y: i32 },
    ButtonDown { button: MouseButton },
    ButtonUp { button: MouseButton },
    Scroll { dx: i32, dy: i32 },
}

#[derive(Debug, Default)]
pub struct DryRunDriver {
    events: Mutex<Vec<DriverEvent>>,
    pointer: Mutex<(i32, i32)>,
    pixels: Mutex<HashMap<(i32, i32), Rgb>>,
    screen_size: Option<(u32, u32)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DryRunDriver {
    /// A driver with no screen, as on a headless host.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_screen_size(width: u32, height: u32) -> Self {
        Self {
            screen_size: Some((width, height)),
            ..Self::default()
        }
    }

    pub fn set_pointer(&self, x: i32, y: i32) {
        *lock(&self.pointer) = (x, y);
    }

    /// Paint a pixel. Unpainted pixels read as black.
    pub fn set_pixel(&self, x: i32, y: i32, color: Rgb) {
        lock(&self.pixels).insert((x, y), color);
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    /// Characters pressed so far, in order. Named keys are skipped.
    pub fn typed_text(&self) -> String {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                DriverEvent::KeyDown { key: Key::Char(c) } => Some(*c),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: DriverEvent) {
        debug!(?event, "dry-run input");
        lock(&self.events).push(event);
    }
}

#[async_trait]
impl InputDriver for DryRunDriver {
    async fn key_down(&self, key: Key) -> Result<(), DriverError> {
        self.record(DriverEvent::KeyDown { key });
        Ok(())
    }

    async fn key_up(&self, key: Key) -> Result<(), DriverError> {
        self.record(DriverEvent::KeyUp { key });
        Ok(())
    }

    async fn move_pointer(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.set_pointer(x, y);
        self.record(DriverEvent::Move { x, y });
        Ok(())
    }

    async fn button_down(&self, button: MouseButton) -> Result<(), DriverError> {
        self.record(DriverEvent::ButtonDown { button });
        Ok(())
    }

    async fn button_up(&self, button: MouseButton) -> Result<(), DriverError> {
        self.record(DriverEvent::ButtonUp { button });
        Ok(())
    }

    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), DriverError> {
        self.record(DriverEvent::Scroll { dx, dy });
        Ok(())
    }

    async fn pointer_position(&self) -> Result<(i32, i32), DriverError> {
        Ok(*lock(&self.pointer))
    }

    async fn screen_size(&self) -> Result<(u32, u32), DriverError> {
        self.screen_size.ok_or(DriverError::Unsupported("screen size"))
    }

    async fn pixel_color(&self, x: i32, y: i32) -> Result<Rgb, DriverError> {
        Ok(lock(&self.pixels).get(&(x, y)).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SpecialKey;

    #[tokio::test]
    async fn test_records_events_in_order() {
        let driver = DryRunDriver::new();
        driver.key_down(Key::Special(SpecialKey::Ctrl)).await.unwrap();
        driver.key_down(Key::Char('c')).await.unwrap();
        driver.key_up(Key::Char('c')).await.unwrap();
        driver.move_pointer(3, 4).await.unwrap();

        let events = driver.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], DriverEvent::Move { x: 3, y: 4 });
        assert_eq!(driver.pointer_position().await.unwrap(), (3, 4));
        assert_eq!(driver.typed_text(), "c");
    }

    #[tokio::test]
    async fn test_clear_events_keeps_pointer() {
        let driver = DryRunDriver::new();
        driver.move_pointer(7, 8).await.unwrap();
        driver.key_down(Key::Char('z')).await.unwrap();
        driver.clear_events();
        assert!(driver.events().is_empty());
        assert_eq!(driver.typed_text(), "");
        assert_eq!(driver.pointer_position().await.unwrap(), (7, 8));
    }

    #[tokio::test]
    async fn test_headless_screen_is_unsupported() {
        let driver = DryRunDriver::new();
        assert!(matches!(
            driver.screen_size().await,
            Err(DriverError::Unsupported(_))
        ));
        let sized = DryRunDriver::with_screen_size(800, 600);
        assert_eq!(sized.screen_size().await.unwrap(), (800, 600));
    }

    #[tokio::test]
    async fn test_pixels_default_to_black() {
        let driver = DryRunDriver::new();
        driver.set_pixel(1, 1, Rgb::new(255, 0, 0));
        assert_eq!(driver.pixel_color(1, 1).await.unwrap(), Rgb::new(255, 0, 0));
        assert_eq!(driver.pixel_color(2, 2).await.unwrap(), Rgb::default());
    }
}
