//! Alignment point storage.

use chrono::{DateTime, Utc};

/// One alignment observation: where the sky target was and what the mount
/// encoders read when the operator centered it.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPoint {
    /// Right ascension in hours.
    pub ra_hours: f64,
    /// Declination in degrees.
    pub dec_deg: f64,
    /// Altitude encoder reading, arcseconds.
    pub mount_x: i32,
    /// Roll encoder reading, arcseconds. Roll does not change the pointing
    /// direction, but the value is kept for diagnostics.
    pub mount_y: i32,
    /// Azimuth encoder reading, arcseconds.
    pub mount_z: i32,
    /// Capture time; the solver reframes sky vectors from here to its
    /// reference epoch.
    pub captured_at: DateTime<Utc>,
}

/// Append-only list of alignment points. Points are never mutated; a fresh
/// alignment run starts with [`clear`](Self::clear).
#[derive(Debug, Clone, Default)]
pub struct AlignmentStore {
    points: Vec<AlignmentPoint>,
}

impl AlignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, point: AlignmentPoint) {
        self.points.push(point);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[AlignmentPoint] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_clear() {
        let mut store = AlignmentStore::new();
        assert!(store.is_empty());

        store.add(AlignmentPoint {
            ra_hours: 18.615,
            dec_deg: 38.78,
            mount_x: 120_000,
            mount_y: 0,
            mount_z: 310_000,
            captured_at: Utc::now(),
        });
        assert_eq!(store.len(), 1);
        assert_eq!(store.points()[0].dec_deg, 38.78);

        store.clear();
        assert!(store.is_empty());
    }
}
