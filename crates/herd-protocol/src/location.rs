/// Location privacy — coordinate skewing.
///
/// A true position is moved to a random point inside an annulus
/// (`min_km..=max_km`) before it is persisted, displayed or transmitted.
/// Bounds locatability; not a cryptographic guarantee.
use std::f64::consts::TAU;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Radius used by the planar offset, in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Annulus bounds for skewing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewConfig {
    pub min_km: f64,
    pub max_km: f64,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            min_km: 2.0,
            max_km: 2.7,
        }
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        crate::geo::distance_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Skew a coordinate using the thread-local RNG.
pub fn skew_location(latitude: f64, longitude: f64, config: &SkewConfig) -> Coordinate {
    skew(latitude, longitude, config, &mut rand::rng())
}

/// Move `(latitude, longitude)` by a uniform distance in the annulus along
/// a uniform bearing.
///
/// Small-angle planar offset: the longitude delta is scaled by
/// `1 / cos(latitude)` for meridian convergence.
pub fn skew<R: Rng + ?Sized>(
    latitude: f64,
    longitude: f64,
    config: &SkewConfig,
    rng: &mut R,
) -> Coordinate {
    let lo = config.min_km.min(config.max_km).max(0.0);
    let hi = config.min_km.max(config.max_km).max(0.0);

    let distance = rng.random_range(lo..=hi) / EARTH_RADIUS_KM;
    let bearing = rng.random_range(0.0..TAU);

    let new_lat = latitude + (distance * bearing.cos()).to_degrees();
    let new_lon = longitude + (distance * bearing.sin()).to_degrees() / latitude.to_radians().cos();

    Coordinate {
        latitude: new_lat,
        longitude: wrap_longitude(new_lon),
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        lon
    } else {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn skew_moves_point_into_annulus() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let origin = Coordinate::new(40.0, -74.0);
        for _ in 0..200 {
            let skewed = skew(origin.latitude, origin.longitude, &SkewConfig::default(), &mut rng);
            let km = origin.distance_m(&skewed) / 1000.0;
            assert!((1.99..=2.71).contains(&km), "distance {km} km");
        }
    }

    #[test]
    fn skew_is_random() {
        let a = skew_location(40.0, -74.0, &SkewConfig::default());
        let b = skew_location(40.0, -74.0, &SkewConfig::default());
        assert_ne!(a, b);
    }

    #[test]
    fn inverted_bounds_are_tolerated() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let config = SkewConfig { min_km: 3.0, max_km: 1.0 };
        let origin = Coordinate::new(10.0, 10.0);
        let skewed = skew(10.0, 10.0, &config, &mut rng);
        let km = origin.distance_m(&skewed) / 1000.0;
        assert!((0.99..=3.01).contains(&km));
    }

    #[test]
    fn longitude_wraps_at_antimeridian() {
        assert_eq!(wrap_longitude(181.0), -179.0);
        assert_eq!(wrap_longitude(-181.0), 179.0);
        assert_eq!(wrap_longitude(12.5), 12.5);
    }
}
