//! Celestial tracking and approximate goto.
//!
//! The firmware does the fine tracking; the host's job is to hand it a fresh
//! alignment matrix, the target, and the reference epoch the matrix is
//! anchored to. An approximate goto needs no matrix at all: one recorded
//! point and sidereal bookkeeping get the target into the finder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use thiserror::Error;
use tracing::{info, warn};

use mount::{CommandError, MountClient};
use wire::messages::Axis;

use crate::celestial::{radec_to_altaz, sky_unit_vector};
use crate::solver::{self, Alignment, SolveError};
use crate::store::AlignmentStore;

/// Predicted altitudes above this are close to an alt-az mount's zenith
/// blind spot, where azimuth rates diverge.
const HIGH_ALTITUDE_WARN_DEG: f64 = 80.0;

/// Observer site, degrees; north and east positive. Lives from program start
/// to end and is shared by everything that does pointing math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("mount is not aligned: {0}")]
    NotAligned(#[from] SolveError),
    #[error("no alignment points recorded")]
    NoAlignmentPoints,
    #[error("mount command failed: {0}")]
    Command(#[from] CommandError),
}

/// What a tracking start sent and where the mount should settle.
#[derive(Debug, Clone)]
pub struct TrackingStart {
    pub alignment: Alignment,
    pub reference_time: DateTime<Utc>,
    /// Predicted initial mount pointing direction (unit vector).
    pub predicted_direction: Vector3<f64>,
    pub predicted_alt_deg: f64,
}

/// Tracking façade over a connected mount.
pub struct Tracker {
    client: Arc<MountClient>,
    observer: Observer,
}

impl Tracker {
    pub fn new(client: Arc<MountClient>, observer: Observer) -> Self {
        Self { client, observer }
    }

    pub fn observer(&self) -> Observer {
        self.observer
    }

    /// Re-solve the alignment against the current instant and start
    /// firmware-side tracking of `(ra_hours, dec_deg)`.
    pub fn start_tracking(
        &self,
        store: &AlignmentStore,
        ra_hours: f64,
        dec_deg: f64,
    ) -> Result<TrackingStart, TrackError> {
        self.start_tracking_at(store, ra_hours, dec_deg, Utc::now())
    }

    /// [`start_tracking`](Self::start_tracking) with an explicit reference
    /// epoch.
    pub fn start_tracking_at(
        &self,
        store: &AlignmentStore,
        ra_hours: f64,
        dec_deg: f64,
        t_ref: DateTime<Utc>,
    ) -> Result<TrackingStart, TrackError> {
        // Re-solve at the fresh epoch so the matrix absorbs the sidereal
        // drift since the points were recorded.
        let alignment = solver::solve(store.points(), t_ref)?;

        let sky = sky_unit_vector(ra_hours, dec_deg, t_ref, t_ref);
        let predicted = alignment.matrix * sky;
        let predicted_alt_deg = predicted.z.clamp(-1.0, 1.0).asin().to_degrees();
        if predicted_alt_deg > HIGH_ALTITUDE_WARN_DEG {
            warn!(
                "Target predicted at {predicted_alt_deg:.1} deg altitude; tracking degrades near the zenith"
            );
        }

        let ref_unix = t_ref.timestamp().max(0) as u64;
        self.client.track_celestial(
            ra_hours as f32,
            dec_deg as f32,
            &alignment.matrix_f32(),
            ref_unix,
            self.observer.latitude_deg as f32,
        )?;
        info!(
            "Celestial tracking started: RA {ra_hours:.4} h, Dec {dec_deg:.4} deg, {:?} alignment",
            alignment.quality
        );

        Ok(TrackingStart {
            alignment,
            reference_time: t_ref,
            predicted_direction: predicted,
            predicted_alt_deg,
        })
    }

    /// Slew roughly onto `(ra_hours, dec_deg)` using only the first recorded
    /// alignment point: the difference between where that point was in the
    /// local sky at capture and where the target is now, issued as relative
    /// moves in altitude and azimuth.
    pub fn goto_approximate(
        &self,
        store: &AlignmentStore,
        ra_hours: f64,
        dec_deg: f64,
    ) -> Result<(), TrackError> {
        self.goto_approximate_at(store, ra_hours, dec_deg, Utc::now())
    }

    /// [`goto_approximate`](Self::goto_approximate) with an explicit "now".
    pub fn goto_approximate_at(
        &self,
        store: &AlignmentStore,
        ra_hours: f64,
        dec_deg: f64,
        now: DateTime<Utc>,
    ) -> Result<(), TrackError> {
        let reference = store.points().first().ok_or(TrackError::NoAlignmentPoints)?;
        let Observer {
            latitude_deg,
            longitude_deg,
        } = self.observer;

        let from = radec_to_altaz(
            reference.ra_hours,
            reference.dec_deg,
            reference.captured_at,
            latitude_deg,
            longitude_deg,
        );
        let to = radec_to_altaz(ra_hours, dec_deg, now, latitude_deg, longitude_deg);

        let delta_alt_arcsec = (to.alt_deg - from.alt_deg) * 3600.0;
        let mut delta_az_deg = to.az_deg - from.az_deg;
        // Shortest way around, wrapped to (-180, 180].
        while delta_az_deg > 180.0 {
            delta_az_deg -= 360.0;
        }
        while delta_az_deg <= -180.0 {
            delta_az_deg += 360.0;
        }
        let delta_az_arcsec = delta_az_deg * 3600.0;

        info!(
            "Approximate goto: delta alt {delta_alt_arcsec:.0} arcsec, delta az {delta_az_arcsec:.0} arcsec"
        );
        self.client
            .move_relative(Axis::X, delta_alt_arcsec.round() as i32)?;
        self.client
            .move_relative(Axis::Z, delta_az_arcsec.round() as i32)?;
        Ok(())
    }
}
