use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{LbPolicy, LbPolicyBuilder, LbPolicyOptions, pick_first, round_robin};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::error::LbError;

/// A registry to store and retrieve LB policies.  LB policies are indexed by
/// their names.
///
/// Every channel is handed the registry it should use; there is no process
/// wide registry.
pub struct LbPolicyRegistry {
    m: Mutex<HashMap<String, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    /// Construct an empty LB policy registry.
    pub fn new() -> Self {
        Self {
            m: Mutex::default(),
        }
    }

    /// Construct a registry containing the built-in policies.
    pub fn with_default_policies() -> Self {
        let registry = Self::new();
        pick_first::reg(&registry);
        round_robin::reg(&registry);
        registry
    }

    /// Add a LB policy into the registry, replacing any policy registered
    /// under the same name.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.m
            .lock()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieve a LB policy from the registry, or None if not found.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.lock().get(name).cloned()
    }

    /// Builds a new instance of the policy registered as `name`.
    pub fn create(&self, name: &str, options: LbPolicyOptions) -> Result<Box<dyn LbPolicy>, LbError> {
        let builder = self
            .get_policy(name)
            .ok_or_else(|| LbError::PolicyNotFound(name.to_string()))?;
        Ok(builder.build(options))
    }

    /// Selects and parses the LB policy configuration from a service config
    /// `loadBalancingConfig` value.
    ///
    /// The value is either a single `{"policy_name": {...}}` object or a list
    /// of such objects in order of preference. The first entry whose policy
    /// is registered is parsed by that policy's builder; later entries are
    /// ignored even if the selected one fails to parse.
    pub fn parse_config(&self, value: &serde_json::Value) -> Result<LbConfig, LbError> {
        let entries: Vec<&serde_json::Value> = match value {
            serde_json::Value::Array(list) => list.iter().collect(),
            other => vec![other],
        };
        let mut names = Vec::with_capacity(entries.len());
        for entry in entries {
            let (name, config) = single_entry(entry)?;
            let Some(builder) = self.get_policy(name) else {
                debug!("skipping unregistered LB policy {name}");
                names.push(name.to_string());
                continue;
            };
            let parsed = builder.parse_config(&ParsedJsonLbConfig::new(config.clone()))?;
            return Ok(parsed.unwrap_or_else(|| LbConfig::new(name, ())));
        }
        Err(LbError::PolicyNotFound(names.join(", ")))
    }

    /// Like [`LbPolicyRegistry::parse_config`] for a JSON document.
    pub fn parse_config_str(&self, json: &str) -> Result<LbConfig, LbError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| LbError::invalid_config("loadBalancingConfig", err))?;
        self.parse_config(&value)
    }
}

// Extracts the single `name: config` pair of a policy entry.
fn single_entry(entry: &serde_json::Value) -> Result<(&str, &serde_json::Value), LbError> {
    let serde_json::Value::Object(map) = entry else {
        return Err(LbError::invalid_config(
            "loadBalancingConfig",
            format!("expected an object, got {entry}"),
        ));
    };
    let mut iter = map.iter();
    match (iter.next(), iter.next()) {
        (Some((name, config)), None) => Ok((name.as_str(), config)),
        _ => Err(LbError::invalid_config(
            "loadBalancingConfig",
            format!("expected exactly one policy per entry, got {}", map.len()),
        )),
    }
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
