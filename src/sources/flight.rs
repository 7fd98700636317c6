//! Live flight-data overlay.
//!
//! Aircraft positions come from a dump1090/readsb style `aircraft.json`
//! endpoint. A refresher thread replaces the cached flight list every few
//! seconds; frames list the nearest aircraft first, one per text line.

use anyhow::{anyhow, Context, Result};
use embedded_graphics::mono_font::ascii::FONT_5X8;
use embedded_graphics::mono_font::MonoFont;
use embedded_graphics::prelude::Point;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::refresher::Refresher;
use super::render::{self, GREEN};
use super::FrameSource;
use crate::frame::{blank_grid, Dimensions, PixelGrid, BACKGROUND};

const FONT: &MonoFont<'static> = &FONT_5X8;
const LINE_SPACING: u32 = 8;
const REFRESH_PERIOD: Duration = Duration::from_secs(3);
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const EARTH_RADIUS_MILES: f64 = 3958.8;
const FLIGHT_LABEL_CHARS: usize = 6;
pub const DEFAULT_FEED_URL: &str = "http://127.0.0.1:8080/data/aircraft.json";

const AIRLINES: &[(&str, &str)] = &[
    ("JBU", "Jet Blue"),
    ("UAL", "United"),
    ("DAL", "Delta"),
    ("ASA", "Alaska"),
    ("AAL", "American"),
    ("AFR", "Air France"),
    ("BAW", "British Airways"),
    ("KAP", "Cape Air"),
    ("SAS", "Scandinavian"),
    ("EIN", "Aer Lingus"),
    ("SWA", "Southwest"),
    ("EJA", "NetJets"),
    ("NKS", "Spirit"),
    ("AAY", "Allegiant"),
    ("POE", "Porter Airlines"),
    ("KLM", "KLM"),
    ("DLH", "Lufthansa"),
    ("VIR", "Virgin Atlantic"),
];

/// Display name for the airline encoded in a callsign's ICAO prefix.
pub fn airline_name(callsign: &str) -> Option<&'static str> {
    let prefix = callsign.get(..3)?;
    AIRLINES
        .iter()
        .find(|(icao, _)| *icao == prefix)
        .map(|(_, name)| *name)
}

// ----------------------------------------------------------------------------
// Geometry
// ----------------------------------------------------------------------------

/// Longitude/latitude pair in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

/// Area of interest; `x` is longitude and `y` latitude. Corners may be given in
/// any order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn contains(&self, location: Location) -> bool {
        let (west, east) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (south, north) = (self.y1.min(self.y2), self.y1.max(self.y2));
        (west..=east).contains(&location.longitude) && (south..=north).contains(&location.latitude)
    }
}

/// Great-circle distance in statute miles.
pub fn distance_miles(a: Location, b: Location) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn from_track(track: f64) -> Self {
        if track > 100.0 && track < 300.0 {
            Self::Out
        } else {
            Self::In
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::In => "In",
            Self::Out => "Out",
        }
    }
}

// ----------------------------------------------------------------------------
// Feed
// ----------------------------------------------------------------------------

/// One aircraft record as reported by the receiver.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Aircraft {
    pub hex: String,
    #[serde(default)]
    pub flight: Option<String>,
    /// Aircraft type designator, present when the receiver has a type database.
    #[serde(default, rename = "t")]
    pub type_code: Option<String>,
    /// Ground speed in knots.
    #[serde(default, rename = "gs")]
    pub ground_speed: Option<f64>,
    #[serde(default)]
    pub track: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AircraftReport {
    #[serde(default)]
    aircraft: Vec<Aircraft>,
}

pub fn parse_report(body: &str) -> Result<Vec<Aircraft>> {
    let report: AircraftReport = serde_json::from_str(body).context("parse aircraft report")?;
    Ok(report.aircraft)
}

pub trait FlightFeed: Send {
    fn fetch(&mut self) -> Result<Vec<Aircraft>>;
}

/// HTTP feed reading `aircraft.json`.
pub struct Dump1090Feed {
    agent: ureq::Agent,
    url: String,
    token: Option<String>,
}

impl Dump1090Feed {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build(),
            url: url.into(),
            token,
        }
    }
}

impl FlightFeed for Dump1090Feed {
    fn fetch(&mut self) -> Result<Vec<Aircraft>> {
        let mut request = self.agent.get(&self.url);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        let body = request
            .call()
            .with_context(|| format!("fetch aircraft from {}", self.url))?
            .into_string()
            .context("read aircraft response")?;
        parse_report(&body)
    }
}

// ----------------------------------------------------------------------------
// Summaries
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct FlightSummary {
    pub aircraft: String,
    pub speed_knots: u32,
    pub distance_miles: f64,
    pub label: String,
    pub direction: Direction,
}

impl FlightSummary {
    /// `aircraft speed distance flight direction`, speed right-aligned to three digits.
    pub fn display_line(&self) -> String {
        let label: String = self.label.chars().take(FLIGHT_LABEL_CHARS).collect();
        format!(
            "{} {:3} {} {} {}",
            self.aircraft,
            self.speed_knots,
            format_distance(self.distance_miles),
            label,
            self.direction.label()
        )
    }
}

fn format_distance(miles: f64) -> String {
    if miles < 10.0 {
        format!("{:.2}", miles)
    } else if miles < 100.0 {
        format!("{:.1}", miles)
    } else {
        format!("{:.0}", miles)
    }
}

/// Keep positioned aircraft inside `bounds`, nearest to `home` first.
pub fn summarize(aircraft: &[Aircraft], bounds: &BoundingBox, home: Location) -> Vec<FlightSummary> {
    let mut flights: Vec<FlightSummary> = aircraft
        .iter()
        .filter_map(|a| {
            let location = Location {
                longitude: a.lon?,
                latitude: a.lat?,
            };
            if !bounds.contains(location) {
                return None;
            }
            let callsign = a
                .flight
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(&a.hex);
            Some(FlightSummary {
                aircraft: a.type_code.clone().unwrap_or_else(|| "????".to_string()),
                speed_knots: a.ground_speed.unwrap_or(0.0).max(0.0).round() as u32,
                distance_miles: distance_miles(home, location),
                label: airline_name(callsign)
                    .map(str::to_string)
                    .unwrap_or_else(|| callsign.to_string()),
                direction: Direction::from_track(a.track.unwrap_or(0.0)),
            })
        })
        .collect();
    flights.sort_by(|a, b| a.distance_miles.total_cmp(&b.distance_miles));
    flights
}

// ----------------------------------------------------------------------------
// Source
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct FlightConfig {
    pub feed_url: String,
    pub token: Option<String>,
    pub bounds: BoundingBox,
    pub home: Location,
}

pub struct FlightDataSource {
    dimensions: Dimensions,
    bounds: BoundingBox,
    home: Location,
    feed: Arc<Mutex<Box<dyn FlightFeed>>>,
    flights: Arc<Mutex<Vec<FlightSummary>>>,
    refresher: Option<Refresher>,
}

impl FlightDataSource {
    pub fn new(
        dimensions: Dimensions,
        feed: Box<dyn FlightFeed>,
        bounds: BoundingBox,
        home: Location,
    ) -> Self {
        Self {
            dimensions,
            bounds,
            home,
            feed: Arc::new(Mutex::new(feed)),
            flights: Arc::new(Mutex::new(Vec::new())),
            refresher: None,
        }
    }

    pub fn from_config(config: &FlightConfig, dimensions: Dimensions) -> Result<Self> {
        if config.feed_url.trim().is_empty() {
            return Err(anyhow!("flight feed url is empty"));
        }
        log::info!(
            "flight data source using {} ({})",
            config.feed_url,
            if config.token.is_some() {
                "with token"
            } else {
                "without token"
            }
        );
        Ok(Self::new(
            dimensions,
            Box::new(Dump1090Feed::new(config.feed_url.clone(), config.token.clone())),
            config.bounds,
            config.home,
        ))
    }
}

fn refresh_flights(
    feed: &Mutex<Box<dyn FlightFeed>>,
    flights: &Mutex<Vec<FlightSummary>>,
    bounds: &BoundingBox,
    home: Location,
) -> Result<()> {
    let aircraft = feed
        .lock()
        .map_err(|_| anyhow!("flight feed lock poisoned"))?
        .fetch()?;
    let summaries = summarize(&aircraft, bounds, home);
    log::debug!(
        "flight refresh: {} aircraft, {} in range",
        aircraft.len(),
        summaries.len()
    );
    *flights
        .lock()
        .map_err(|_| anyhow!("flight cache lock poisoned"))? = summaries;
    Ok(())
}

impl FrameSource for FlightDataSource {
    fn name(&self) -> &str {
        "FlightRadar24"
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn activate(&mut self) -> Result<()> {
        if self.refresher.is_some() {
            return Ok(());
        }
        self.flights
            .lock()
            .map_err(|_| anyhow!("flight cache lock poisoned"))?
            .clear();

        let feed = Arc::clone(&self.feed);
        let flights = Arc::clone(&self.flights);
        let (bounds, home) = (self.bounds, self.home);
        self.refresher = Some(Refresher::spawn(
            "flight refresher",
            REFRESH_PERIOD,
            move |_| {
                if let Err(e) = refresh_flights(&feed, &flights, &bounds, home) {
                    log::warn!("flight refresh failed: {:#}", e);
                }
            },
        )?);
        log::info!("FlightRadar24: activated");
        Ok(())
    }

    fn produce_frame(&mut self) -> Result<PixelGrid> {
        if self.refresher.is_none() {
            return Err(anyhow!("flight data source is not active"));
        }
        let mut grid = blank_grid(self.dimensions, BACKGROUND);
        let flights = self
            .flights
            .lock()
            .map_err(|_| anyhow!("flight cache lock poisoned"))?;
        let rows = (self.dimensions.height / LINE_SPACING) as usize;
        for (row, flight) in flights.iter().take(rows).enumerate() {
            let y = (row as u32 * LINE_SPACING) as i32;
            render::draw_text(&mut grid, &flight.display_line(), Point::new(0, y), FONT, GREEN);
        }
        Ok(grid)
    }

    fn deactivate(&mut self) -> Result<()> {
        if let Some(mut refresher) = self.refresher.take() {
            refresher.stop()?;
            log::info!("FlightRadar24: deactivated");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.refresher.is_some()
    }
}
