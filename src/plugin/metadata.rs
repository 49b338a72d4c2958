//! Plugin Metadata
//!
//! The immutable descriptor of a plugin artifact and the embedded JSON
//! descriptor format it is read from.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bitflags::bitflags;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PluginError, PluginResult};
use crate::version::{host_api_version, Version};

/// Primary key of a loaded plugin
pub type PluginId = String;

bitflags! {
    /// Declared plugin features.
    ///
    /// Overlapping bits (for example `SERVICE` and `SCRIPTING`) are advisory;
    /// registered service contracts are authoritative for what a plugin offers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const UI = 1 << 0;
        const SERVICE = 1 << 1;
        const NETWORK = 1 << 2;
        const DATA_PROCESSING = 1 << 3;
        const SCRIPTING = 1 << 4;
        const FILE_SYSTEM = 1 << 5;
        const DATABASE = 1 << 6;
        const ASYNC_INIT = 1 << 7;
        const HOT_RELOAD = 1 << 8;
        const CONFIGURATION = 1 << 9;
        const LOGGING = 1 << 10;
        const SECURITY = 1 << 11;
        const THREADING = 1 << 12;
        const MONITORING = 1 << 13;
    }
}

const CAPABILITY_NAMES: &[(&str, Capabilities)] = &[
    ("UI", Capabilities::UI),
    ("Service", Capabilities::SERVICE),
    ("Network", Capabilities::NETWORK),
    ("DataProcessing", Capabilities::DATA_PROCESSING),
    ("Scripting", Capabilities::SCRIPTING),
    ("FileSystem", Capabilities::FILE_SYSTEM),
    ("Database", Capabilities::DATABASE),
    ("AsyncInit", Capabilities::ASYNC_INIT),
    ("HotReload", Capabilities::HOT_RELOAD),
    ("Configuration", Capabilities::CONFIGURATION),
    ("Logging", Capabilities::LOGGING),
    ("Security", Capabilities::SECURITY),
    ("Threading", Capabilities::THREADING),
    ("Monitoring", Capabilities::MONITORING),
];

impl Capabilities {
    /// Look up a single capability by its descriptor name
    pub fn from_descriptor_name(name: &str) -> Option<Capabilities> {
        CAPABILITY_NAMES
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, flag)| *flag)
    }

    /// Descriptor names of every bit set, in declaration order
    pub fn names(&self) -> Vec<&'static str> {
        CAPABILITY_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse a list of descriptor names; unknown names are rejected
    pub fn from_names<I, S>(names: I) -> PluginResult<Capabilities>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = Capabilities::empty();
        for name in names {
            let name = name.as_ref();
            let flag = Capabilities::from_descriptor_name(name).ok_or_else(|| {
                PluginError::metadata_invalid(format!("Unknown capability '{}'", name))
                    .with_context("capability", name)
            })?;
            caps |= flag;
        }
        Ok(caps)
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Capabilities::from_names(&names).map_err(serde::de::Error::custom)
    }
}

/// Plugin priority, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

impl Priority {
    /// Numeric rank used by priority queues
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Lowest => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Highest => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Lowest => "Lowest",
            Priority::Low => "Low",
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Highest => "Highest",
        };
        f.write_str(name)
    }
}

/// Threading expectations a plugin declares for its callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ThreadModel {
    Main,
    Worker,
    #[default]
    Any,
}

/// A dependency on another plugin, optionally with a minimum compatible version.
///
/// Written in descriptors as `"id"` or `"id@X.Y.Z"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginDependency {
    pub id: PluginId,
    pub version: Option<Version>,
}

impl PluginDependency {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    pub fn with_version<S: Into<String>>(id: S, version: Version) -> Self {
        Self {
            id: id.into(),
            version: Some(version),
        }
    }

    /// Whether a provider at `version` satisfies this dependency
    pub fn accepts(&self, version: &Version) -> bool {
        match &self.version {
            Some(required) => version.is_compatible_with(required),
            None => true,
        }
    }
}

impl FromStr for PluginDependency {
    type Err = PluginError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let (id, version) = match text.split_once('@') {
            Some((id, version)) => (id.trim(), Some(Version::parse(version)?)),
            None => (text, None),
        };
        if id.is_empty() {
            return Err(PluginError::metadata_invalid(format!(
                "Dependency entry '{}' has an empty id",
                text
            )));
        }
        Ok(Self {
            id: id.to_string(),
            version,
        })
    }
}

impl fmt::Display for PluginDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.id, version),
            None => f.write_str(&self.id),
        }
    }
}

impl Serialize for PluginDependency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PluginDependency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable description of a plugin artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Descriptor", into = "Descriptor")]
pub struct PluginMetadata {
    pub id: PluginId,
    pub name: String,
    pub version: Version,
    pub description: String,
    pub author: String,
    pub license: String,
    pub homepage: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<PluginDependency>,
    pub optional_dependencies: Vec<PluginDependency>,
    pub capabilities: Capabilities,
    pub priority: Priority,
    pub thread_model: ThreadModel,
    /// Minimum host API this artifact was built against
    pub host_api: Option<Version>,
}

/// Wire shape of the embedded JSON descriptor. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Descriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    description: String,
    author: String,
    license: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
    category: String,
    tags: Vec<String>,
    dependencies: Vec<PluginDependency>,
    optional_dependencies: Vec<PluginDependency>,
    capabilities: Capabilities,
    priority: Priority,
    thread_model: ThreadModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_api: Option<Version>,
}

impl TryFrom<Descriptor> for PluginMetadata {
    type Error = PluginError;

    fn try_from(raw: Descriptor) -> Result<Self, Self::Error> {
        let name = raw
            .name
            .ok_or_else(|| PluginError::metadata_invalid("Descriptor is missing required key 'name'"))?;
        let version_text = raw.version.ok_or_else(|| {
            PluginError::metadata_invalid("Descriptor is missing required key 'version'")
                .with_context("name", name.clone())
        })?;
        let version = Version::parse(&version_text).map_err(|e| {
            PluginError::metadata_invalid(format!("Invalid version '{}'", version_text))
                .with_context("name", name.clone())
                .with_cause(e)
        })?;

        Ok(Self {
            id: raw.id.unwrap_or_else(|| name.clone()),
            name,
            version,
            description: raw.description,
            author: raw.author,
            license: raw.license,
            homepage: raw.homepage,
            category: raw.category,
            tags: raw.tags,
            dependencies: raw.dependencies,
            optional_dependencies: raw.optional_dependencies,
            capabilities: raw.capabilities,
            priority: raw.priority,
            thread_model: raw.thread_model,
            host_api: raw.host_api,
        })
    }
}

impl From<PluginMetadata> for Descriptor {
    fn from(meta: PluginMetadata) -> Self {
        Self {
            id: Some(meta.id),
            name: Some(meta.name),
            version: Some(meta.version.to_string()),
            description: meta.description,
            author: meta.author,
            license: meta.license,
            homepage: meta.homepage,
            category: meta.category,
            tags: meta.tags,
            dependencies: meta.dependencies,
            optional_dependencies: meta.optional_dependencies,
            capabilities: meta.capabilities,
            priority: meta.priority,
            thread_model: meta.thread_model,
            host_api: meta.host_api,
        }
    }
}

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").ok())
        .as_ref()
}

impl PluginMetadata {
    /// Minimal metadata with the id used as the display name
    pub fn new<S: Into<String>>(id: S, version: Version) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version,
            description: String::new(),
            author: String::new(),
            license: String::new(),
            homepage: None,
            category: String::new(),
            tags: Vec::new(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            capabilities: Capabilities::empty(),
            priority: Priority::Normal,
            thread_model: ThreadModel::Any,
            host_api: None,
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_optional_dependency(mut self, dependency: PluginDependency) -> Self {
        self.optional_dependencies.push(dependency);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_host_api(mut self, version: Version) -> Self {
        self.host_api = Some(version);
        self
    }

    /// Parse an embedded JSON descriptor. Does not validate.
    pub fn from_json(text: &str) -> PluginResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            PluginError::metadata_invalid(format!("Malformed plugin descriptor: {}", e))
        })
    }

    /// Serialize back to descriptor JSON
    pub fn to_json(&self) -> PluginResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn has_capability(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    /// Ids of required dependencies
    pub fn dependency_ids(&self) -> Vec<&str> {
        self.dependencies.iter().map(|d| d.id.as_str()).collect()
    }

    /// Validate the descriptor and its compatibility with this host
    pub fn validate(&self) -> PluginResult<()> {
        if self.id.trim().is_empty() {
            return Err(PluginError::metadata_invalid("Plugin id must not be empty"));
        }
        match id_pattern() {
            Some(pattern) if !pattern.is_match(&self.id) => {
                return Err(PluginError::metadata_invalid(format!(
                    "Plugin id '{}' contains invalid characters",
                    self.id
                ))
                .with_plugin(&self.id));
            }
            Some(_) => {}
            None => return Err(PluginError::internal("Plugin id pattern failed to compile")),
        }

        let self_dependency = self
            .dependencies
            .iter()
            .chain(self.optional_dependencies.iter())
            .any(|dep| dep.id == self.id);
        if self_dependency {
            return Err(PluginError::metadata_invalid(format!(
                "Plugin '{}' declares a dependency on itself",
                self.id
            ))
            .with_plugin(&self.id));
        }

        if let Some(required) = &self.host_api {
            let host = host_api_version();
            if !host.is_compatible_with(required) {
                return Err(PluginError::incompatible_version(format!(
                    "Plugin '{}' requires host API {}, host provides {}",
                    self.id, required, host
                ))
                .with_plugin(&self.id)
                .with_context("required", required.to_string())
                .with_context("host", host.to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_parse_minimal_descriptor() {
        let meta = PluginMetadata::from_json(r#"{"name": "a", "version": "1.0.0"}"#).unwrap();
        assert_eq!(meta.id, "a");
        assert_eq!(meta.name, "a");
        assert_eq!(meta.version, Version::new(1, 0, 0));
        assert_eq!(meta.priority, Priority::Normal);
        assert_eq!(meta.thread_model, ThreadModel::Any);
        assert!(meta.capabilities.is_empty());
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_parse_full_descriptor_ignores_unknown_keys() {
        let json = r#"{
            "id": "csv-reader",
            "name": "CSV Reader",
            "version": "2.1.0",
            "description": "Reads CSV",
            "author": "someone",
            "license": "MIT",
            "homepage": "https://example.invalid",
            "category": "io",
            "tags": ["csv", "io"],
            "dependencies": ["core@1.0.0", "fs"],
            "optional_dependencies": ["metrics"],
            "capabilities": ["DataProcessing", "FileSystem", "HotReload"],
            "priority": "High",
            "thread_model": "Worker",
            "marketplace_rating": 5
        }"#;
        let meta = PluginMetadata::from_json(json).unwrap();
        assert_eq!(meta.id, "csv-reader");
        assert_eq!(meta.dependencies.len(), 2);
        assert_eq!(meta.dependencies[0].version, Some(Version::new(1, 0, 0)));
        assert_eq!(meta.dependency_ids(), vec!["core", "fs"]);
        assert!(meta.has_capability(Capabilities::HOT_RELOAD));
        assert!(meta.has_capability(Capabilities::FILE_SYSTEM | Capabilities::DATA_PROCESSING));
        assert_eq!(meta.priority, Priority::High);
        assert_eq!(meta.thread_model, ThreadModel::Worker);
    }

    #[test]
    fn test_missing_required_keys() {
        let err = PluginMetadata::from_json(r#"{"version": "1.0.0"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
        let err = PluginMetadata::from_json(r#"{"name": "a"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
        let err = PluginMetadata::from_json("not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
    }

    #[test]
    fn test_unknown_capability_and_priority_rejected() {
        let err = PluginMetadata::from_json(
            r#"{"name": "a", "version": "1.0.0", "capabilities": ["Telepathy"]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
        let err = PluginMetadata::from_json(
            r#"{"name": "a", "version": "1.0.0", "priority": "Urgent"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
    }

    #[test]
    fn test_validation_rules() {
        let selfish = PluginMetadata::new("a", Version::new(1, 0, 0))
            .with_dependency(PluginDependency::new("a"));
        assert_eq!(selfish.validate().unwrap_err().kind(), ErrorKind::MetadataInvalid);

        let blank = PluginMetadata::new("  ", Version::new(1, 0, 0));
        assert_eq!(blank.validate().unwrap_err().kind(), ErrorKind::MetadataInvalid);

        let odd = PluginMetadata::new("a b", Version::new(1, 0, 0));
        assert_eq!(odd.validate().unwrap_err().kind(), ErrorKind::MetadataInvalid);

        let host = host_api_version();
        let future = PluginMetadata::new("a", Version::new(1, 0, 0))
            .with_host_api(Version::new(host.major() + 1, 0, 0));
        assert_eq!(future.validate().unwrap_err().kind(), ErrorKind::IncompatibleVersion);

        let current = PluginMetadata::new("a", Version::new(1, 0, 0))
            .with_host_api(Version::new(host.major(), 0, 0));
        assert!(current.validate().is_ok());
    }

    #[test]
    fn test_dependency_parsing() {
        let dep: PluginDependency = "core@1.2.0".parse().unwrap();
        assert_eq!(dep.id, "core");
        assert!(dep.accepts(&Version::new(1, 3, 0)));
        assert!(!dep.accepts(&Version::new(2, 0, 0)));
        assert_eq!(dep.to_string(), "core@1.2.0");
        assert!("@1.0.0".parse::<PluginDependency>().is_err());
        assert!("core@x".parse::<PluginDependency>().is_err());
    }

    #[test]
    fn test_capability_names() {
        let caps = Capabilities::from_names(["service", "Monitoring"]).unwrap();
        assert_eq!(caps.names(), vec!["Service", "Monitoring"]);
    }

    #[test]
    fn test_descriptor_names_differ_from_flag_names() {
        assert_eq!(
            Capabilities::from_descriptor_name("hotreload"),
            Some(Capabilities::HOT_RELOAD)
        );
        assert_eq!(Capabilities::from_descriptor_name("HOT_RELOAD"), None);
        // generated lookup by constant name still works alongside
        assert_eq!(Capabilities::from_name("HOT_RELOAD"), Some(Capabilities::HOT_RELOAD));
    }

    fn arb_metadata() -> impl Strategy<Value = PluginMetadata> {
        (
            "[a-z][a-z0-9_-]{0,12}",
            (0u64..10, 0u64..10, 0u64..10),
            proptest::collection::vec("[a-z]{1,8}", 0..4),
            proptest::collection::vec("[a-z]{1,6}", 0..3),
            0u32..(1 << 14),
            0usize..5,
        )
            .prop_map(|(id, (ma, mi, pa), tags, deps, bits, prio)| {
                let mut meta = PluginMetadata::new(id, Version::new(ma, mi, pa))
                    .with_capabilities(Capabilities::from_bits_truncate(bits))
                    .with_priority(
                        [
                            Priority::Lowest,
                            Priority::Low,
                            Priority::Normal,
                            Priority::High,
                            Priority::Highest,
                        ][prio],
                    );
                meta.tags = tags;
                meta.dependencies = deps
                    .into_iter()
                    .map(|d| PluginDependency::with_version(format!("dep-{}", d), Version::new(1, 0, 0)))
                    .collect();
                meta
            })
    }

    proptest! {
        #[test]
        fn prop_metadata_json_roundtrip(meta in arb_metadata()) {
            let json = meta.to_json().unwrap();
            let back = PluginMetadata::from_json(&json).unwrap();
            prop_assert_eq!(back, meta);
        }
    }
}
