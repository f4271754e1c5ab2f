use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Plain north/south/east/west rectangle, the shape sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsRect {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundsRect {
    /// Smallest rectangle covering every point, `None` for an empty iterator.
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = LatLng>,
    {
        points.into_iter().fold(None, |acc, point| {
            Some(match acc {
                None => BoundsRect {
                    north: point.lat,
                    south: point.lat,
                    east: point.lng,
                    west: point.lng,
                },
                Some(rect) => BoundsRect {
                    north: rect.north.max(point.lat),
                    south: rect.south.min(point.lat),
                    east: rect.east.max(point.lng),
                    west: rect.west.min(point.lng),
                },
            })
        })
    }
}

/// Bounds as reported by the map surface. Some renderers hand back edge
/// values, others the north-west and south-east corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoBounds {
    Rect(BoundsRect),
    Corners { north_west: LatLng, south_east: LatLng },
}

impl GeoBounds {
    pub fn normalize(&self) -> AppResult<BoundsRect> {
        let rect = match *self {
            GeoBounds::Rect(rect) => rect,
            GeoBounds::Corners {
                north_west,
                south_east,
            } => BoundsRect {
                north: north_west.lat,
                west: north_west.lng,
                south: south_east.lat,
                east: south_east.lng,
            },
        };

        let values = [rect.north, rect.south, rect.east, rect.west];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Bounds(format!(
                "non-finite edge in {rect:?}"
            )));
        }
        if rect.north < rect.south {
            return Err(AppError::Bounds(format!(
                "north {} lies below south {}",
                rect.north, rect.south
            )));
        }
        Ok(rect)
    }
}

impl From<BoundsRect> for GeoBounds {
    fn from(value: BoundsRect) -> Self {
        GeoBounds::Rect(value)
    }
}

pub fn clamp_zoom(value: i32, min: u8, max: u8) -> u8 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    value.clamp(i32::from(lo), i32::from(hi)) as u8
}
