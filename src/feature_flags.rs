//! Boolean feature gates with environment and runtime overrides (spec §4.A).

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::config::flag_env_var;
use crate::event_bus::{EmitterError, Event, EventEmitter, FeatureFlagEvent};

#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum FeatureFlagError {
    #[error("unknown feature flag: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::feature_flags::unknown)))]
    Unknown(String),
}

/// Resolves one flag's initial value per §4.A's fallback chain: explicit
/// constructor default, then `ENABLE_<UPPER_SNAKE>`, then `true`.
fn resolve_initial(name: &str, explicit: Option<bool>) -> bool {
    if let Some(value) = explicit {
        return value;
    }
    let var = flag_env_var(name);
    match std::env::var(&var) {
        Ok(raw) => match crate::config::parse_bool_env(&raw, true) {
            Some(value) => value,
            None => {
                tracing::warn!(flag = name, env_var = %var, raw = %raw, "unrecognized boolean token, using default");
                true
            }
        },
        Err(_) => true,
    }
}

pub struct FeatureFlags {
    values: RwLock<FxHashMap<String, bool>>,
    explicit_defaults: FxHashMap<String, bool>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl FeatureFlags {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::with_defaults(names.into_iter().map(|n| (n.into(), None::<bool>)))
    }

    /// `defaults` entries with `Some(value)` pin that flag's explicit default,
    /// overriding the otherwise-`true` static default (still beaten by a
    /// parseable env var per §4.A precedence).
    pub fn with_defaults(defaults: impl IntoIterator<Item = (String, Option<bool>)>) -> Self {
        let mut values = FxHashMap::default();
        let mut explicit_defaults = FxHashMap::default();
        for (name, explicit) in defaults {
            values.insert(name.clone(), resolve_initial(&name, explicit));
            if let Some(value) = explicit {
                explicit_defaults.insert(name, value);
            }
        }
        Self {
            values: RwLock::new(values),
            explicit_defaults,
            emitter: None,
        }
    }

    pub fn register(&self, name: impl Into<String>, explicit_default: Option<bool>) {
        let name = name.into();
        let value = resolve_initial(&name, explicit_default);
        self.values.write().insert(name, value);
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        match self.values.read().get(name) {
            Some(value) => *value,
            None => {
                tracing::warn!(flag = name, "isEnabled called on unknown flag");
                false
            }
        }
    }

    pub fn get_all(&self) -> FxHashMap<String, bool> {
        self.values.read().clone()
    }

    pub fn get_enabled(&self) -> Vec<String> {
        self.values
            .read()
            .iter()
            .filter(|(_, v)| **v)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn get_disabled(&self) -> Vec<String> {
        self.values
            .read()
            .iter()
            .filter(|(_, v)| !**v)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn set_flag(&self, name: &str, value: bool) -> Result<(), FeatureFlagError> {
        let mut values = self.values.write();
        let entry = values
            .get_mut(name)
            .ok_or_else(|| FeatureFlagError::Unknown(name.to_string()))?;
        let changed = *entry != value;
        *entry = value;
        drop(values);
        if changed {
            self.emit(Event::FeatureFlag(FeatureFlagEvent::Changed {
                name: name.to_string(),
                value,
            }));
        }
        Ok(())
    }

    /// Re-reads every known flag's environment variable; returns the names
    /// that changed and emits `flags:reloaded` only when that list is non-empty.
    pub fn reload(&self) -> Vec<String> {
        let names: Vec<String> = self.values.read().keys().cloned().collect();
        let mut changed = Vec::new();
        {
            let mut values = self.values.write();
            for name in &names {
                let explicit = self.explicit_defaults.get(name).copied();
                let resolved = resolve_initial(name, explicit);
                if values.get(name) != Some(&resolved) {
                    values.insert(name.clone(), resolved);
                    changed.push(name.clone());
                }
            }
        }
        if !changed.is_empty() {
            self.emit(Event::FeatureFlag(FeatureFlagEvent::Reloaded { changed: changed.clone() }));
        }
        changed
    }

    pub fn get_summary(&self) -> FeatureFlagSummary {
        let values = self.values.read();
        FeatureFlagSummary {
            total: values.len(),
            enabled: values.values().filter(|v| **v).count(),
            disabled: values.values().filter(|v| !**v).count(),
            flags: values.clone(),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
        {
            match err {
                EmitterError::Closed => tracing::debug!("feature flag event dropped, bus closed"),
                other => tracing::warn!(error = %other, "failed to emit feature flag event"),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureFlagSummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub flags: FxHashMap<String, bool>,
}

static GLOBAL: OnceLock<Arc<FeatureFlags>> = OnceLock::new();

/// Process-wide feature-flag singleton, lazily constructed with no flags
/// registered. Callers register the flags they own before first use.
pub fn global() -> Arc<FeatureFlags> {
    GLOBAL
        .get_or_init(|| Arc::new(FeatureFlags::new(Vec::<String>::new())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flag_warns_and_returns_false() {
        let flags = FeatureFlags::new(vec!["a"]);
        assert!(!flags.is_enabled("missing"));
    }

    #[test]
    fn default_is_true_absent_override() {
        let flags = FeatureFlags::new(vec!["alpha"]);
        assert!(flags.is_enabled("alpha"));
    }

    #[test]
    fn explicit_default_wins_over_static_true() {
        let flags = FeatureFlags::with_defaults(vec![("beta".to_string(), Some(false))]);
        assert!(!flags.is_enabled("beta"));
    }

    #[test]
    fn set_flag_rejects_unknown_name() {
        let flags = FeatureFlags::new(vec!["alpha"]);
        assert!(matches!(flags.set_flag("nope", true), Err(FeatureFlagError::Unknown(_))));
    }

    #[test]
    fn set_flag_only_changes_value_once() {
        let flags = FeatureFlags::new(vec!["alpha"]);
        flags.set_flag("alpha", false).unwrap();
        assert!(!flags.is_enabled("alpha"));
        flags.set_flag("alpha", false).unwrap();
        assert!(!flags.is_enabled("alpha"));
    }

    #[test]
    fn get_enabled_and_disabled_partition_all_flags() {
        let flags = FeatureFlags::with_defaults(vec![
            ("a".to_string(), Some(true)),
            ("b".to_string(), Some(false)),
        ]);
        assert_eq!(flags.get_enabled(), vec!["a".to_string()]);
        assert_eq!(flags.get_disabled(), vec!["b".to_string()]);
    }

    #[test]
    fn reload_picks_up_env_var_change() {
        let flags = FeatureFlags::new(vec!["cacheEnabled"]);
        unsafe {
            std::env::set_var("ENABLE_CACHE_ENABLED", "false");
        }
        let changed = flags.reload();
        assert_eq!(changed, vec!["cacheEnabled".to_string()]);
        assert!(!flags.is_enabled("cacheEnabled"));
        unsafe {
            std::env::remove_var("ENABLE_CACHE_ENABLED");
        }
    }
}
