//! GPX parsing and the statistics shown in the info panel.

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::geo::{BoundsRect, LatLng};

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const SMOOTHING_WINDOW: usize = 5;
const ELEVATION_THRESHOLD_M: f64 = 0.5;
const MOVING_SPEED_MIN_MPS: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub position: LatLng,
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ParsedTrack {
    /// One entry per `trkseg`/`rte`, kept apart so gaps are not bridged.
    pub segments: Vec<Vec<TrackPoint>>,
    pub waypoints: Vec<LatLng>,
}

impl ParsedTrack {
    pub fn bounds(&self) -> Option<BoundsRect> {
        BoundsRect::enclosing(
            self.segments
                .iter()
                .flatten()
                .map(|point| point.position)
                .chain(self.waypoints.iter().copied()),
        )
    }

    pub fn stats(&self) -> TrackStats {
        let mut distance_m = 0.0;
        let mut moving_distance_m = 0.0;
        let mut moving_time_ms = 0_i64;
        for segment in &self.segments {
            for pair in segment.windows(2) {
                let step = haversine_m(pair[0].position, pair[1].position);
                distance_m += step;
                if let (Some(a), Some(b)) = (pair[0].time, pair[1].time) {
                    let elapsed_ms = (b - a).num_milliseconds();
                    if elapsed_ms > 0 && step / (elapsed_ms as f64 / 1000.0) >= MOVING_SPEED_MIN_MPS
                    {
                        moving_time_ms += elapsed_ms;
                        moving_distance_m += step;
                    }
                }
            }
        }

        let mut times = self.segments.iter().flatten().filter_map(|p| p.time);
        let start_time = times.next();
        let end_time = times.last().or(start_time);
        let total_time_ms = match (start_time, end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => 0,
        };

        let elevations: Vec<f64> = self
            .segments
            .iter()
            .flatten()
            .filter_map(|p| p.elevation)
            .collect();
        let (elevation_gain_m, elevation_loss_m) = smoothed_elevation(&elevations);

        let moving_speed_kmh = if moving_time_ms > 0 {
            (moving_distance_m / 1000.0) / (moving_time_ms as f64 / 3_600_000.0)
        } else {
            0.0
        };

        TrackStats {
            distance_m,
            total_time_ms: total_time_ms as u64,
            moving_time_ms: moving_time_ms as u64,
            start_time,
            moving_speed_kmh,
            elevation_gain_m,
            elevation_loss_m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStats {
    pub distance_m: f64,
    pub total_time_ms: u64,
    pub moving_time_ms: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub moving_speed_kmh: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
}

/// Display strings for the statistics panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoPanel {
    pub name: String,
    pub distance: String,
    pub duration: String,
    pub date: String,
    pub speed: String,
    pub elevation_gain: String,
    pub elevation_loss: String,
}

impl TrackStats {
    pub fn info_panel(&self, name: &str) -> InfoPanel {
        let duration_ms = if self.moving_time_ms > 0 {
            self.moving_time_ms
        } else {
            self.total_time_ms
        };
        InfoPanel {
            name: name.to_string(),
            distance: format!("{:.2} km", self.distance_m / 1000.0),
            duration: format_duration(duration_ms),
            date: self
                .start_time
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "N/A".into()),
            speed: format!("{:.1} km/h", self.moving_speed_kmh),
            elevation_gain: format!("+{} m", self.elevation_gain_m.round() as i64),
            elevation_loss: format!("-{} m", self.elevation_loss_m.round() as i64),
        }
    }
}

pub fn parse_gpx(bytes: &[u8]) -> AppResult<ParsedTrack> {
    let xml = std::str::from_utf8(bytes)
        .map_err(|err| AppError::Parse(format!("invalid UTF-8: {err}")))?;
    let document = Document::parse(xml).map_err(|err| AppError::Parse(err.to_string()))?;
    let root = document.root_element();
    if root.tag_name().name() != "gpx" {
        return Err(AppError::Parse(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }

    let mut segments = Vec::new();
    for container in root
        .descendants()
        .filter(|node| matches!(node.tag_name().name(), "trkseg" | "rte"))
    {
        let mut points = Vec::new();
        for node in container
            .children()
            .filter(|node| matches!(node.tag_name().name(), "trkpt" | "rtept"))
        {
            points.push(parse_point(node)?);
        }
        if !points.is_empty() {
            segments.push(points);
        }
    }

    let waypoints = root
        .children()
        .filter(|node| node.tag_name().name() == "wpt")
        .map(|node| parse_point(node).map(|point| point.position))
        .collect::<AppResult<Vec<_>>>()?;

    if segments.is_empty() && waypoints.is_empty() {
        return Err(AppError::Parse("document has no track points".into()));
    }

    Ok(ParsedTrack {
        segments,
        waypoints,
    })
}

fn parse_point(node: Node<'_, '_>) -> AppResult<TrackPoint> {
    let coordinate = |name: &str| -> AppResult<f64> {
        node.attribute(name)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                AppError::Parse(format!(
                    "<{}> missing numeric {name} attribute",
                    node.tag_name().name()
                ))
            })
    };
    let position = LatLng::new(coordinate("lat")?, coordinate("lon")?);

    let child_text = |name: &str| {
        node.children()
            .find(|child| child.tag_name().name() == name)
            .and_then(|child| child.text())
            .map(str::trim)
    };
    let elevation = child_text("ele").and_then(|text| text.parse::<f64>().ok());
    let time = child_text("time")
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|t| t.with_timezone(&Utc));

    Ok(TrackPoint {
        position,
        elevation,
        time,
    })
}

fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Gain and loss after a centered moving average; steps under the threshold
/// are treated as noise.
pub fn smoothed_elevation(elevations: &[f64]) -> (f64, f64) {
    if elevations.is_empty() {
        return (0.0, 0.0);
    }

    let half = SMOOTHING_WINDOW / 2;
    let smoothed: Vec<f64> = (0..elevations.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(elevations.len() - 1);
            let window = &elevations[lo..=hi];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect();

    let mut gain = 0.0;
    let mut loss = 0.0;
    for pair in smoothed.windows(2) {
        let diff = pair[1] - pair[0];
        if diff.abs() > ELEVATION_THRESHOLD_M {
            if diff > 0.0 {
                gain += diff;
            } else {
                loss += diff.abs();
            }
        }
    }
    (gain, loss)
}

pub fn format_duration(ms: u64) -> String {
    if ms == 0 {
        return "-".into();
    }
    let minutes = (ms / 60_000) % 60;
    let hours = ms / 3_600_000;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
