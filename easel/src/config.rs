use serde::{Deserialize, Serialize};

use easel_catalog as ec;
use easel_core::settings::{ChannelOverrides, Settings};

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub playback: Settings,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

impl Config {
    pub const FILENAME: &str = "easel.toml";

    pub fn load() -> Self {
        match std::fs::read_to_string(Self::FILENAME) {
            Ok(contents) => {
                // Config exists, try to parse it
                match toml::from_str(&contents) {
                    Ok(config) => config,
                    Err(e) => panic!("Failed to parse {}: {e}", Self::FILENAME),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No config exists, create default
                tracing::info!("no config file found, using defaults");
                Config::default()
            }
            Err(e) => {
                // Some other IO error occurred while reading
                panic!("Failed to read {}: {e}", Self::FILENAME)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct General {
    pub catalog_base_url: String,
    pub device_id: String,
    pub device_token: String,
    pub data_dir: String,
}
impl Default for General {
    fn default() -> Self {
        Self {
            catalog_base_url: "http://localhost:8035".to_string(),
            device_id: "YOUR_DEVICE_ID".to_string(),
            device_token: "YOUR_DEVICE_TOKEN".to_string(),
            data_dir: "./easel-data".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSpec {
    pub id: String,
    /// "all", "promoted", "user", "user:<sqid>", "tag:<tag>", or
    /// "artwork:<post_id>".
    pub selector: String,
    /// "newest" or "oldest".
    pub sort: String,
    pub overrides: ChannelOverrides,
}
impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            id: "all".to_string(),
            selector: "all".to_string(),
            sort: "newest".to_string(),
            overrides: ChannelOverrides::default(),
        }
    }
}

impl ChannelSpec {
    pub fn parsed_selector(&self) -> ec::ChannelSelector {
        if let Some(sqid) = self.selector.strip_prefix("user:") {
            return ec::ChannelSelector::ByUser(sqid.to_string());
        }
        if let Some(tag) = self.selector.strip_prefix("tag:") {
            return ec::ChannelSelector::Hashtag(tag.to_string());
        }
        if let Some(post_id) = self.selector.strip_prefix("artwork:") {
            if let Ok(post_id) = post_id.parse() {
                return ec::ChannelSelector::Artwork(post_id);
            }
            tracing::warn!("unparseable artwork selector {:?}, showing all", self.selector);
            return ec::ChannelSelector::All;
        }
        match self.selector.as_str() {
            "promoted" => ec::ChannelSelector::Promoted,
            "user" => ec::ChannelSelector::User,
            "all" => ec::ChannelSelector::All,
            other => {
                tracing::warn!("unknown selector {other:?}, showing all");
                ec::ChannelSelector::All
            }
        }
    }

    pub fn parsed_sort(&self) -> ec::PostSort {
        match self.sort.as_str() {
            "oldest" => ec::PostSort::Oldest,
            _ => ec::PostSort::Newest,
        }
    }
}
