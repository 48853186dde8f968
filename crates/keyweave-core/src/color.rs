//! Colour parsing and comparison for `pixel` conditions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default tolerance for `pixel,x,y,#RRGGBB` when none is given.
pub const DEFAULT_TOLERANCE: f64 = 10.0;

/// An RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Euclidean distance in RGB space, from `0` (identical) to about `441`.
    pub fn distance(&self, other: &Rgb) -> f64 {
        let dr = f64::from(self.r) - f64::from(other.r);
        let dg = f64::from(self.g) - f64::from(other.g);
        let db = f64::from(self.b) - f64::from(other.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }

    pub fn matches(&self, other: &Rgb, tolerance: f64) -> bool {
        self.distance(other) <= tolerance
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parses `#RRGGBB` (the `#` is optional).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected #RRGGBB, got '{}'", s.trim()));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| format!("invalid hex colour '{}'", s.trim()))
        };
        Ok(Rgb::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let c: Rgb = "#ff8000".parse().unwrap();
        assert_eq!(c, Rgb::new(255, 128, 0));
        assert_eq!(c.to_string(), "#FF8000");
        assert_eq!("00FF00".parse::<Rgb>().unwrap(), Rgb::new(0, 255, 0));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("#fff".parse::<Rgb>().is_err());
        assert!("#gg0000".parse::<Rgb>().is_err());
        assert!("".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_distance_and_tolerance() {
        let a = Rgb::new(100, 100, 100);
        let b = Rgb::new(103, 104, 100);
        assert_eq!(a.distance(&b), 5.0);
        assert!(a.matches(&b, DEFAULT_TOLERANCE));
        assert!(!a.matches(&Rgb::new(120, 100, 100), DEFAULT_TOLERANCE));
    }
}
