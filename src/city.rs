/*
A small concrete object type: a named point on a latitude/longitude plane,
with the plain Euclidean metric over the coordinates. The driver program and
the integration tests index cities; the tree itself only ever sees them
through the Object and MetricEvaluator traits.

Serialized form: latitude f64, longitude f64, then the name bytes (the name
length is whatever remains, so no length prefix is stored).
*/

use crate::metric::MetricEvaluator;
use crate::object::Object;

#[derive(Debug, Clone, PartialEq)]
pub struct City {
    name: String,
    latitude: f64,
    longitude: f64,
}

impl City {
    pub fn new(name: &str, latitude: f64, longitude: f64) -> Self {
        City {
            name: name.to_string(),
            latitude,
            longitude,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl Object for City {
    fn serialized_size(&self) -> usize {
        16 + self.name.len()
    }

    fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.extend_from_slice(&self.latitude.to_ne_bytes());
        bytes.extend_from_slice(&self.longitude.to_ne_bytes());
        bytes.extend_from_slice(self.name.as_bytes());
        bytes
    }

    fn unserialize(bytes: &[u8]) -> Self {
        let latitude = f64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        let longitude = f64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        let name = String::from_utf8_lossy(&bytes[16..]).into_owned();
        City {
            name,
            latitude,
            longitude,
        }
    }

    fn is_equal(&self, other: &Self) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.name == other.name
    }
}

/// Euclidean distance over the coordinate plane.
pub struct CityDistance;

impl MetricEvaluator<City> for CityDistance {
    fn distance(&self, a: &City, b: &City) -> f64 {
        let d_lat = a.latitude - b.latitude;
        let d_long = a.longitude - b.longitude;
        (d_lat * d_lat + d_long * d_long).sqrt()
    }
}
