//! Weather collaborator — Open-Meteo forecasts with Nominatim geocoding,
//! behind the [`WeatherProvider`] trait. `lat,lon` parsing and forecast
//! formatting are pure and unit-tested; only the HTTP calls are glue.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::error::WeatherError;
use crate::session::GeoPoint;

const NOMINATIM_SEARCH: &str = "https://nominatim.openstreetmap.org/search";
const NOMINATIM_REVERSE: &str = "https://nominatim.openstreetmap.org/reverse";
const METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";
const USER_AGENT: &str = concat!("meshdm/", env!("CARGO_PKG_VERSION"));

/// Rendered forecast, hourly and daily lines ready for downlink.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub hourly: Vec<String>,
    pub daily: Vec<String>,
}

impl Forecast {
    /// One reply body; the chunker handles frame sizing.
    pub fn render(&self, label: &str) -> String {
        format!(
            "Weather for {label}\nNext 6 hours:\n{}\n\nNext 3 days:\n{}",
            self.hourly.join("\n"),
            self.daily.join("\n"),
        )
    }
}

/// Location resolution + forecast contract the router dispatches `/weather`
/// through.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Resolve `lat,lon` or a free-form place name into a labeled point.
    async fn resolve(&self, query: &str) -> Result<GeoPoint, WeatherError>;

    async fn forecast(&self, point: &GeoPoint) -> Result<Forecast, WeatherError>;
}

/// Parse an explicit `lat,lon` pair. Pure; the fast path of `resolve`.
pub fn parse_coords(query: &str) -> Option<(f64, f64)> {
    let (lat, lon) = query.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Compose a short ASCII label like `Plovdiv, BG`. Some mesh clients render
/// non-ASCII as garbage, so anything else falls back.
fn compose_label(city: &str, admin: &str, country: &str, fallback: &str) -> String {
    let ascii = |s: &str| -> String { s.chars().filter(char::is_ascii).collect::<String>().trim().to_string() };

    let mut parts = Vec::new();
    let first = if !city.trim().is_empty() { ascii(city) } else { ascii(admin) };
    if !first.is_empty() {
        parts.push(first);
    }
    if !country.trim().is_empty() {
        let cc = country.to_uppercase();
        parts.push(if cc.len() <= 3 { cc } else { ascii(country) });
    }

    let mut label = parts.join(", ");
    if label.is_empty() {
        label = fallback.trim().to_string();
    }
    if label.is_empty() {
        label = "unknown location".to_string();
    }
    if label.len() > 60 {
        let mut end = 59;
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        label.truncate(end);
        label.push('~');
    }
    label
}

// ── Forecast line formatting (pure) ─────────────────────────────────

fn hourly_lines(
    times: &[NaiveDateTime],
    temps: &[Option<f64>],
    precs: &[Option<f64>],
    now: NaiveDateTime,
) -> Vec<String> {
    let end_by = now + chrono::Duration::hours(6);
    let mut lines = Vec::new();
    for ((t, temp), prec) in times
        .iter()
        .zip(temps.iter().copied())
        .zip(precs.iter().copied())
    {
        if *t <= now || *t > end_by {
            continue;
        }
        let temp = temp.map_or_else(|| "?".to_string(), |v| format!("{}", v.round() as i64));
        let prec = prec.map_or_else(|| "?".to_string(), |v| format!("{v:.0}"));
        lines.push(format!("{} {temp}C, {prec}%", t.format("%H:00")));
    }
    if lines.is_empty() {
        lines.push("(no hourly data)".to_string());
    }
    lines
}

fn daily_lines(
    dates: &[NaiveDate],
    maxs: &[Option<f64>],
    mins: &[Option<f64>],
    precs: &[Option<f64>],
) -> Vec<String> {
    // Index 0 is today; the reply covers the next three days.
    let mut lines = Vec::new();
    for i in 1..dates.len().min(4) {
        let (Some(tmax), Some(tmin)) = (maxs.get(i).copied().flatten(), mins.get(i).copied().flatten())
        else {
            continue;
        };
        let prec = precs
            .get(i)
            .copied()
            .flatten()
            .map_or_else(|| "?".to_string(), |v| format!("{v:.0}"));
        lines.push(format!(
            "{}: {}-{}C, {prec}%",
            dates[i].format("%a %d %b"),
            tmin.round() as i64,
            tmax.round() as i64,
        ));
    }
    if lines.is_empty() {
        lines.push("(no daily data)".to_string());
    }
    lines
}

// ── HTTP glue ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    county: Option<String>,
    country_code: Option<String>,
    country: Option<String>,
}

impl NominatimAddress {
    fn label(&self, fallback: &str) -> String {
        let city = self
            .city
            .as_deref()
            .or(self.town.as_deref())
            .or(self.village.as_deref())
            .or(self.municipality.as_deref())
            .unwrap_or("");
        let admin = self.state.as_deref().or(self.county.as_deref()).unwrap_or("");
        let country = self
            .country_code
            .as_deref()
            .or(self.country.as_deref())
            .unwrap_or("");
        compose_label(city, admin, country, fallback)
    }
}

#[derive(Debug, Deserialize)]
struct MeteoResponse {
    hourly: MeteoHourly,
    daily: MeteoDaily,
}

#[derive(Debug, Deserialize)]
struct MeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    precipitation_probability: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct MeteoDaily {
    time: Vec<String>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    precipitation_probability_max: Vec<Option<f64>>,
}

/// Open-Meteo + Nominatim implementation of [`WeatherProvider`].
pub struct OpenMeteoProvider {
    client: reqwest::Client,
}

impl OpenMeteoProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn reverse_label(&self, lat: f64, lon: f64) -> Option<String> {
        let place: NominatimPlace = self
            .client
            .get(NOMINATIM_REVERSE)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".into()),
                ("zoom", "10".into()),
                ("addressdetails", "1".into()),
            ])
            .header("User-Agent", USER_AGENT)
            .header("Accept-Language", "en")
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        Some(place.address.label(&format!("{lat:.4},{lon:.4}")))
    }
}

impl Default for OpenMeteoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    async fn resolve(&self, query: &str) -> Result<GeoPoint, WeatherError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(WeatherError::UnknownLocation(query.to_string()));
        }

        if let Some((lat, lon)) = parse_coords(query) {
            let label = self
                .reverse_label(lat, lon)
                .await
                .unwrap_or_else(|| format!("{lat:.4},{lon:.4}"));
            return Ok(GeoPoint { lat, lon, label });
        }

        let places: Vec<NominatimPlace> = self
            .client
            .get(NOMINATIM_SEARCH)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("addressdetails", "1"),
            ])
            .header("User-Agent", USER_AGENT)
            .header("Accept-Language", "en")
            .send()
            .await
            .map_err(|e| WeatherError::FetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| WeatherError::FetchFailed(e.to_string()))?;

        let place = places
            .into_iter()
            .next()
            .ok_or_else(|| WeatherError::UnknownLocation(query.to_string()))?;

        let lat: f64 = place
            .lat
            .parse()
            .map_err(|_| WeatherError::FetchFailed("bad latitude in geocode".into()))?;
        let lon: f64 = place
            .lon
            .parse()
            .map_err(|_| WeatherError::FetchFailed("bad longitude in geocode".into()))?;

        let fallback = place
            .display_name
            .split(',')
            .next()
            .unwrap_or(query)
            .to_string();
        let label = place.address.label(if fallback.is_empty() { query } else { &fallback });

        Ok(GeoPoint { lat, lon, label })
    }

    async fn forecast(&self, point: &GeoPoint) -> Result<Forecast, WeatherError> {
        let resp: MeteoResponse = self
            .client
            .get(METEO_URL)
            .query(&[
                ("latitude", point.lat.to_string()),
                ("longitude", point.lon.to_string()),
                ("hourly", "temperature_2m,precipitation_probability".into()),
                (
                    "daily",
                    "temperature_2m_max,temperature_2m_min,precipitation_probability_max".into(),
                ),
                ("forecast_days", "4".into()),
                ("timezone", "auto".into()),
            ])
            .send()
            .await
            .map_err(|e| WeatherError::FetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| WeatherError::FetchFailed(e.to_string()))?;

        let times: Vec<NaiveDateTime> = resp
            .hourly
            .time
            .iter()
            .filter_map(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M").ok())
            .collect();
        let dates: Vec<NaiveDate> = resp
            .daily
            .time
            .iter()
            .filter_map(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok())
            .collect();

        // timezone=auto makes the API return the location's local clock.
        let now = chrono::Local::now().naive_local();

        Ok(Forecast {
            hourly: hourly_lines(
                &times,
                &resp.hourly.temperature_2m,
                &resp.hourly.precipitation_probability,
                now,
            ),
            daily: daily_lines(
                &dates,
                &resp.daily.temperature_2m_max,
                &resp.daily.temperature_2m_min,
                &resp.daily.precipitation_probability_max,
            ),
        })
    }
}
