use serde::{Deserialize, Serialize};

use crate::CoreError;

/// SRID of the `observation.location` column.
pub const WEB_MERCATOR_SRID: i32 = 3857;

const EARTH_RADIUS_M: f64 = 6_378_137.0;
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wgs84Point {
    pub lat: f64,
    pub lon: f64,
}

/// Point in EPSG:3857 metres, the storage projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MercatorPoint {
    pub x: f64,
    pub y: f64,
}

impl Wgs84Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Spherical Web Mercator. Latitudes beyond the projection's square are
    /// clamped to its edge.
    pub fn to_web_mercator(self) -> Result<MercatorPoint, CoreError> {
        let valid = self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon);
        if !valid {
            return Err(CoreError::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            });
        }

        let lat = self.lat.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
        let x = EARTH_RADIUS_M * self.lon.to_radians();
        let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
        Ok(MercatorPoint { x, y })
    }
}
