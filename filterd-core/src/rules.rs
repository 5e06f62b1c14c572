//! Compiled filter lists and per-host rule decisions.
//!
//! Filter lists come from an external rule store through [`RuleSource`]. Each enabled
//! list is compiled once into [`Wildcard`]s and cached by name, so concurrent
//! inspections share the compiled form.

use crate::wildcard::Wildcard;
use dashmap::DashMap;
use filterd_config::Config;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A named list of glob patterns as delivered by the rule store
#[derive(Debug, Clone)]
pub struct FilterList {
    pub name: String,
    pub enabled: bool,
    pub patterns: Vec<String>,
}

/// Storage collaborator supplying filter lists
pub trait RuleSource: Send + Sync {
    fn filter_lists(&self) -> Vec<FilterList>;
}

/// Only enabled lists are handed out, disabled ones never get compiled
impl RuleSource for Config {
    fn filter_lists(&self) -> Vec<FilterList> {
        self.enabled_filter_lists()
            .map(|list| FilterList {
                name: list.name.clone(),
                enabled: list.enabled,
                patterns: list.patterns.clone(),
            })
            .collect()
    }
}

impl RuleSource for Vec<FilterList> {
    fn filter_lists(&self) -> Vec<FilterList> {
        self.clone()
    }
}

/// What should happen to traffic for a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Host is exempt from filtering
    Whitelisted,
    /// Rules of the named list apply
    Filter { list: String },
    /// No list matches, or the host is unknown
    PassThrough,
}

impl FilterDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterDecision::Whitelisted => "whitelisted",
            FilterDecision::Filter { .. } => "filter",
            FilterDecision::PassThrough => "pass_through",
        }
    }
}

/// Compiled whitelist plus every enabled filter list
pub struct RuleSet {
    whitelist: Vec<Wildcard>,
    lists: DashMap<String, Arc<Vec<Wildcard>>>,
    /// List names in load order, evaluation follows it
    order: Vec<String>,
}

impl RuleSet {
    /// Compiles the enabled lists of `source`
    ///
    /// Patterns that fail to compile are logged and skipped.
    pub fn load<S: RuleSource + ?Sized>(source: &S, whitelist: &[String]) -> Self {
        let lists = DashMap::new();
        let mut order = Vec::new();

        for list in source.filter_lists() {
            if !list.enabled {
                debug!(list = list.name, "Skipping disabled filter list");
                continue;
            }
            let compiled = compile_patterns(&list.name, &list.patterns);
            info!(list = list.name, patterns = compiled.len(), "Loaded filter list");
            order.push(list.name.clone());
            lists.insert(list.name, Arc::new(compiled));
        }

        Self {
            whitelist: compile_patterns("whitelist", whitelist),
            lists,
            order,
        }
    }

    /// Builds the rule set described by a configuration file
    pub fn from_config(config: &Config) -> Self {
        Self::load(config, &config.whitelist)
    }

    /// Replaces the compiled patterns of one list, returns false for unknown lists
    pub fn reload_list(&self, list: &FilterList) -> bool {
        let Some(mut entry) = self.lists.get_mut(&list.name) else {
            warn!(list = list.name, "Cannot reload unknown filter list");
            return false;
        };

        let compiled = if list.enabled {
            compile_patterns(&list.name, &list.patterns)
        } else {
            Vec::new()
        };
        info!(list = list.name, patterns = compiled.len(), "Reloaded filter list");
        *entry = Arc::new(compiled);
        true
    }

    /// Compiled patterns of a list
    pub fn list(&self, name: &str) -> Option<Arc<Vec<Wildcard>>> {
        self.lists.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list_names(&self) -> &[String] {
        &self.order
    }

    /// Decides whether filtering rules apply to `host`
    pub fn evaluate(&self, host: &str) -> FilterDecision {
        if self.whitelist.iter().any(|w| w.matches(host)) {
            return FilterDecision::Whitelisted;
        }

        for name in &self.order {
            let Some(patterns) = self.list(name) else {
                continue;
            };
            if patterns.iter().any(|w| w.matches(host)) {
                return FilterDecision::Filter { list: name.clone() };
            }
        }

        FilterDecision::PassThrough
    }
}

fn compile_patterns(list: &str, patterns: &[String]) -> Vec<Wildcard> {
    patterns
        .iter()
        .filter(|pattern| !pattern.trim().is_empty())
        .filter_map(|pattern| match Wildcard::new(pattern.trim()) {
            Ok(wildcard) => Some(wildcard),
            Err(e) => {
                warn!(list, pattern = pattern.as_str(), error = %e, "Skipping invalid pattern");
                None
            }
        })
        .collect()
}
