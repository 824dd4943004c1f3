use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_IMAGE: &str = "debian:bookworm-slim";
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Binds a container name to the recipe producing its image: an already
/// built local image, a source folder to containerize, or a handle the
/// containerizer can prepare a source folder from.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ImageMap {
    pub name: String,
    pub local_image: Option<String>,
    pub source: Option<String>,
    pub handle: Option<String>,
    pub prepare: PrepareConfig,
    pub build: BuildConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PrepareConfig {
    pub base_image: String,
    pub expose: Vec<u16>,
    pub requirements: Vec<String>,
    pub prepare_in_place: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            expose: vec![],
            requirements: vec![],
            prepare_in_place: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub image_name: Option<String>,
    pub platform: String,
    pub nocache: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image_name: None,
            platform: DEFAULT_PLATFORM.to_string(),
            nocache: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub detach: bool,
    pub remove: bool,
    pub ports: HashMap<String, u16>,
    pub env: HashMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            detach: true,
            remove: true,
            ports: HashMap::new(),
            env: HashMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceItem {
    pub source: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ImageItem {
    pub name: String,
    pub digest: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<ImageItem>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RegistryItem {
    pub image_name: String,
    pub image_uri: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RegistryItemDigest {
    pub image_uri: String,
    pub digest: String,
    #[serde(default)]
    pub image_size_bytes: Option<u64>,
    #[serde(default)]
    pub upload_time: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}
