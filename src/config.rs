//! Engine configuration
//!
//! The agent hands the engine a _feature string_ such as
//! `;namespace=default;unsafe.enable=false;`, which can then be completed by a properties file.

use crate::spy::BridgeNames;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// What happens when a listener fails inside a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerErrorPolicy {
    /// Log the failure and let the method carry on
    Swallow,

    /// Make the method throw a `RuntimeException` describing the failure
    Propagate,
}

impl FromStr for ListenerErrorPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "swallow" => Ok(ListenerErrorPolicy::Swallow),
            "propagate" => Ok(ListenerErrorPolicy::Propagate),
            other => Err(format!("unknown listener error policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Entry without a `=`
    MalformedEntry(String),

    /// Known key with a value that doesn't parse
    BadValue { key: String, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MalformedEntry(entry) => write!(f, "malformed config entry '{}'", entry),
            ConfigError::BadValue { key, message } => {
                write!(f, "bad value for config key '{}': {}", key, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Isolates several engines living in the same runtime
    pub namespace: String,

    /// Allow instrumenting types from the root loader
    pub unsafe_enabled: bool,

    /// Prefix the runtime uses when wrapping native methods (empty when unused)
    pub native_prefix: String,

    /// Java name of the bridge class woven code calls
    pub spy_class: String,

    /// Package of the engine itself, which is never instrumented (eg. `jvm.sandbox.`)
    pub engine_package: String,

    pub listener_error_policy: ListenerErrorPolicy,

    /// Bound on the queue of watch requests (producers block when it is full)
    pub pipeline_queue_capacity: usize,

    /// Bound on the queue of coalesced groups waiting for a worker
    pub pipeline_flush_capacity: usize,
    pub pipeline_workers: usize,

    /// Most requests coalesced into one flush
    pub pipeline_batch_size: usize,

    /// Most type structures kept by the structure factory
    pub structure_cache_capacity: usize,

    /// Keys this engine doesn't know about, kept for whoever does
    pub extra: BTreeMap<String, String>,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            namespace: String::from("default"),
            unsafe_enabled: false,
            native_prefix: String::new(),
            spy_class: String::from(BridgeNames::DEFAULT_SPY_CLASS),
            engine_package: String::from("jvm.sandbox."),
            listener_error_policy: ListenerErrorPolicy::Swallow,
            pipeline_queue_capacity: 512,
            pipeline_flush_capacity: 300,
            pipeline_workers: 4,
            pipeline_batch_size: 512,
            structure_cache_capacity: 1024,
            extra: BTreeMap::new(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::BadValue {
        key: String::from(key),
        message: err.to_string(),
    })
}

/// Pool and queue sizes must be at least one
fn parse_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    match parse_value(key, value)? {
        0 => Err(ConfigError::BadValue {
            key: String::from(key),
            message: String::from("must be positive"),
        }),
        size => Ok(size),
    }
}

impl CoreConfig {
    /// Keys which a properties file may not override
    pub const PROTECTED_KEYS: [&'static str; 1] = ["namespace"];

    /// Parse a feature string (entries separated by `;`, keys and values by `=`)
    pub fn from_feature_string(features: &str) -> Result<CoreConfig, ConfigError> {
        let mut config = CoreConfig::default();
        for (key, value) in entries(features.split(';'))? {
            config.set(&key, &value)?;
        }
        Ok(config)
    }

    /// Merge the contents of a properties file (`key=value` lines, `#` or `!` comments)
    pub fn merge_properties(&mut self, properties: &str) -> Result<(), ConfigError> {
        for (key, value) in entries(properties.lines())? {
            if CoreConfig::PROTECTED_KEYS.contains(&key.as_str()) {
                log::warn!("Ignoring protected key '{}' from properties", key);
                continue;
            }
            self.set(&key, &value)?;
        }
        Ok(())
    }

    /// Set one key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "namespace" => self.namespace = String::from(value.trim()),
            "unsafe.enable" => self.unsafe_enabled = parse_value(key, value)?,
            "native.prefix" => self.native_prefix = String::from(value.trim()),
            "spy.class" => {
                BridgeNames::from_java_name(value.trim())
                    .map_err(|message| ConfigError::BadValue {
                        key: String::from(key),
                        message,
                    })?;
                self.spy_class = String::from(value.trim());
            }
            "engine.package" => self.engine_package = String::from(value.trim()),
            "listener.error.policy" => self.listener_error_policy = parse_value(key, value)?,
            "pipeline.queue.capacity" => self.pipeline_queue_capacity = parse_size(key, value)?,
            "pipeline.flush.capacity" => self.pipeline_flush_capacity = parse_size(key, value)?,
            "pipeline.workers" => self.pipeline_workers = parse_size(key, value)?,
            "pipeline.batch.size" => self.pipeline_batch_size = parse_size(key, value)?,
            "structure.cache.capacity" => self.structure_cache_capacity = parse_size(key, value)?,
            _ => {
                log::debug!("Keeping unknown config key '{}'", key);
                self.extra.insert(String::from(key), String::from(value));
            }
        }
        Ok(())
    }

    /// Names of the bridge classes
    pub fn bridge_names(&self) -> BridgeNames {
        match BridgeNames::from_java_name(&self.spy_class) {
            Ok(names) => names,
            Err(_) => BridgeNames::default(),
        }
    }

    /// Packages which are never instrumented: the engine and the bridge
    pub fn excluded_packages(&self) -> Vec<String> {
        let mut packages = vec![self.engine_package.clone()];
        let bridge_package = self.bridge_names().java_package();
        if !bridge_package.is_empty() && !packages.contains(&bridge_package) {
            packages.push(bridge_package);
        }
        packages
    }
}

fn entries<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut entries = vec![];
    for line in lines.map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => entries.push((String::from(key.trim()), String::from(value))),
            None => return Err(ConfigError::MalformedEntry(String::from(line))),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoreConfig::from_feature_string("").unwrap();
        assert_eq!(config.namespace, "default");
        assert!(!config.unsafe_enabled);
        assert_eq!(config.listener_error_policy, ListenerErrorPolicy::Swallow);
        assert_eq!(config.pipeline_queue_capacity, 512);
        assert_eq!(config.pipeline_flush_capacity, 300);
        assert_eq!(config.pipeline_workers, 4);
        assert_eq!(config.structure_cache_capacity, 1024);
    }

    #[test]
    fn feature_string() {
        let config = CoreConfig::from_feature_string(
            ";namespace=acme;unsafe.enable=true;listener.error.policy=PROPAGATE;mode=agent;",
        )
        .unwrap();
        assert_eq!(config.namespace, "acme");
        assert!(config.unsafe_enabled);
        assert_eq!(config.listener_error_policy, ListenerErrorPolicy::Propagate);
        assert_eq!(config.extra.get("mode").map(String::as_str), Some("agent"));
    }

    #[test]
    fn bad_values() {
        assert_eq!(
            CoreConfig::from_feature_string(";namespace").unwrap_err(),
            ConfigError::MalformedEntry(String::from("namespace"))
        );
        assert!(CoreConfig::from_feature_string("unsafe.enable=maybe").is_err());
        assert!(CoreConfig::from_feature_string("pipeline.workers=0").is_err());
        assert!(CoreConfig::from_feature_string("spy.class=com..acme.Spy").is_err());
    }

    #[test]
    fn properties_cannot_change_the_namespace() {
        let mut config = CoreConfig::from_feature_string("namespace=acme").unwrap();
        config
            .merge_properties("# engine\nnamespace=other\npipeline.workers = 2\n")
            .unwrap();
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.pipeline_workers, 2);
    }

    #[test]
    fn excluded_packages() {
        let config = CoreConfig::from_feature_string("spy.class=com.acme.agent.Spy").unwrap();
        assert_eq!(
            config.excluded_packages(),
            vec![String::from("jvm.sandbox."), String::from("com.acme.agent.")]
        );
    }
}
