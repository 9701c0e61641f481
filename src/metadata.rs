//! Seam for the external anime metadata API.
//!
//! The real network client lives outside this crate; data migration and
//! population steps only see this trait. Everything a provider returns is
//! untrusted external data and is validated at the point of use, exactly
//! like legacy rows.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::AniTrackError;

/// Enrichment data for one series.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesInfo {
    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    /// Episode count per season, first season first.
    #[serde(default)]
    pub season_episodes: Vec<i64>,
}

pub trait MetadataProvider {
    /// Enrichment for a series, looked up by its sanitised name. `None` when
    /// the source has nothing for it.
    fn series_info(&self, name: &str) -> Option<SeriesInfo>;
}

/// Provider used when no metadata source is configured.
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn series_info(&self, _name: &str) -> Option<SeriesInfo> {
        None
    }
}

/// Canned metadata loaded from a JSON file keyed by sanitised series name,
/// the shape the API client exports.
pub struct JsonFileProvider {
    series: HashMap<String, SeriesInfo>,
}

impl JsonFileProvider {
    pub fn load(path: &Path) -> Result<Self, AniTrackError> {
        let file = File::open(path)?;
        let series: HashMap<String, SeriesInfo> = serde_json::from_reader(BufReader::new(file))?;
        info!(
            "Loaded metadata for {} series from {}",
            series.len(),
            path.display()
        );
        Ok(Self { series })
    }
}

impl MetadataProvider for JsonFileProvider {
    fn series_info(&self, name: &str) -> Option<SeriesInfo> {
        self.series.get(name).cloned()
    }
}
