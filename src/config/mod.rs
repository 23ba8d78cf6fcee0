use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod validation;

/// Audio mime types the server indexes and announces.
pub const AUDIO_MIME_TYPES: &[&str] = &[
    "audio/aac",
    "audio/flac",
    "audio/mp4",
    "audio/mpeg",
    "audio/ogg",
    "audio/opus",
    "audio/x-flac",
];

/// Image mime types accepted as embedded cover art.
pub const IMAGE_MIME_TYPES: &[&str] = &["image/jpeg", "image/png"];

/// Playlist mime types the server indexes.
pub const PLAYLIST_MIME_TYPES: &[&str] = &[
    "application/pls+xml",
    "audio/x-mpegurl",
    "audio/x-scpls",
];

/// Main application configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub content: ContentConfig,
    pub upnp: UpnpConfig,
    #[serde(default)]
    pub cache_dir: String,
    #[serde(default)]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Content section: music roots, update behavior and browse hierarchies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    pub music_dirs: Vec<PathBuf>,
    #[serde(default = "default_separator")]
    pub separator: String,
    pub update_mode: UpdateMode,
    /// Seconds between update ticks.
    pub update_interval: u64,
    #[serde(default)]
    pub hierarchies: Vec<Hierarchy>,
    #[serde(default)]
    pub show_playlists: bool,
    #[serde(default = "default_playlist_hierarchy_name")]
    pub playlist_hierarchy_name: String,
    #[serde(default)]
    pub show_folders: bool,
    #[serde(default = "default_folder_hierarchy_name")]
    pub folder_hierarchy_name: String,
}

/// UPnP section: HTTP port, identity and SSDP parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpnpConfig {
    pub port: u16,
    pub server_name: String,
    /// Server UUID; generated when empty.
    #[serde(default)]
    pub udn: String,
    /// SSDP alive renewal period in seconds.
    pub max_age: u32,
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Notify,
    Scan,
}

/// One configured browse hierarchy, e.g. Genre -> Album -> Track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hierarchy {
    pub name: String,
    pub levels: Vec<Level>,
}

/// One level of a browse hierarchy with its sort specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    #[serde(rename = "type")]
    pub typ: LevelType,
    #[serde(default)]
    pub sort: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelType {
    Genre,
    AlbumArtist,
    Artist,
    Album,
    Track,
}

/// Attribute an object array can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Title,
    TrackNo,
    DiscNo,
    Year,
    LastChange,
}

impl SortField {
    pub(crate) fn from_name(s: &str) -> Option<SortField> {
        match s {
            "title" => Some(SortField::Title),
            "trackNo" => Some(SortField::TrackNo),
            "discNo" => Some(SortField::DiscNo),
            "year" => Some(SortField::Year),
            "lastChange" => Some(SortField::LastChange),
            _ => None,
        }
    }
}

/// Direction of one entry of a comparison vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Splits a sort entry like "+year" or "-lastChange" into direction and
/// field name. A missing direction prefix means ascending.
pub fn split_sort(s: &str) -> (SortDir, &str) {
    match s.as_bytes().first() {
        Some(b'+') => (SortDir::Asc, &s[1..]),
        Some(b'-') => (SortDir::Desc, &s[1..]),
        _ => (SortDir::Asc, s),
    }
}

impl Level {
    pub fn sort_fields(&self) -> Vec<SortField> {
        self.sort
            .iter()
            .filter_map(|s| SortField::from_name(split_sort(s).1))
            .collect()
    }

    pub fn comparisons(&self) -> Vec<SortDir> {
        self.sort.iter().map(|s| split_sort(s).0).collect()
    }
}

impl Config {
    /// Reads and parses the configuration file. Validation is separate so
    /// that `--check-config` can report both stages distinctly.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file '{}'", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse config file '{}'", path.display()))?;
        Ok(cfg)
    }

    /// Returns the configured music directory that contains `path`, if any.
    pub fn music_dir_of(&self, path: &Path) -> Option<&PathBuf> {
        self.content
            .music_dirs
            .iter()
            .find(|dir| path.starts_with(dir))
    }

    /// Assembles the SourceProtocolInfo value from the supported mime types.
    pub fn supported_protocol_info(&self) -> String {
        AUDIO_MIME_TYPES
            .iter()
            .chain(IMAGE_MIME_TYPES.iter())
            .map(|m| format!("http-get:*:{m}:*"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_playlist_hierarchy_name() -> String {
    "Playlists".to_string()
}

fn default_folder_hierarchy_name() -> String {
    "Folders".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"{
            "content": {
                "music_dirs": ["/music"],
                "update_mode": "scan",
                "update_interval": 60,
                "hierarchies": [
                    {"name": "Genre", "levels": [
                        {"type": "genre"},
                        {"type": "album", "sort": ["+title"]},
                        {"type": "track", "sort": ["+discNo", "+trackNo"]}
                    ]}
                ]
            },
            "upnp": {
                "port": 8008,
                "server_name": "test",
                "max_age": 1800,
                "status_file": "/tmp/status.json"
            }
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.content.update_mode, UpdateMode::Scan);
        assert_eq!(cfg.content.separator, ";");
        assert_eq!(cfg.content.hierarchies.len(), 1);
        let track = &cfg.content.hierarchies[0].levels[2];
        assert_eq!(track.typ, LevelType::Track);
        assert_eq!(
            track.sort_fields(),
            vec![SortField::DiscNo, SortField::TrackNo]
        );
        assert_eq!(track.comparisons(), vec![SortDir::Asc, SortDir::Asc]);
    }

    #[test]
    fn split_sort_directions() {
        assert_eq!(split_sort("+year"), (SortDir::Asc, "year"));
        assert_eq!(split_sort("-lastChange"), (SortDir::Desc, "lastChange"));
        assert_eq!(split_sort("title"), (SortDir::Asc, "title"));
    }

    #[test]
    fn music_dir_lookup() {
        let raw = r#"{
            "content": {"music_dirs": ["/m1", "/m2"], "update_mode": "scan",
                        "update_interval": 10, "hierarchies": []},
            "upnp": {"port": 8008, "server_name": "t", "max_age": 1800,
                     "status_file": "/tmp/s.json"}
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cfg.music_dir_of(Path::new("/m2/jazz/a.mp3")),
            Some(&PathBuf::from("/m2"))
        );
        assert_eq!(cfg.music_dir_of(Path::new("/elsewhere/a.mp3")), None);
    }
}
