//! Immutable predicates over object metadata used to route watch events.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::meta::{Labels, ObjectMeta};

/// Matches objects by exact name or by a set of required labels.
///
/// `with_*` never mutate: they hand back the same value when nothing would
/// change, otherwise a new filter. Setting a name clears the selectors and
/// setting non-empty selectors clears the name.
#[derive(Clone, Debug, Default)]
pub struct ResourceEventFilter {
    name: Option<String>,
    label_selectors: Arc<Labels>,
}

impl ResourceEventFilter {
    /// Matches every object.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::empty().with_name(name)
    }

    pub fn labelled(selectors: Labels) -> Self {
        Self::empty().with_label_selectors(selectors)
    }

    /// Captures both the name and the full label set of `metadata`.
    pub fn from_metadata(metadata: &ObjectMeta) -> Self {
        Self {
            name: normalize_name(metadata.name.clone()),
            label_selectors: Arc::new(metadata.labels.clone().unwrap_or_default()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn label_selectors(&self) -> &Labels {
        &self.label_selectors
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.label_selectors.is_empty()
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        let name = normalize_name(Some(name.into()));
        if name == self.name {
            return self;
        }
        let label_selectors = if name.is_some() {
            Arc::default()
        } else {
            self.label_selectors
        };
        Self {
            name,
            label_selectors,
        }
    }

    pub fn with_label_selectors(self, selectors: Labels) -> Self {
        if selectors_equivalent(&self.label_selectors, &selectors) {
            return self;
        }
        let name = if selectors.is_empty() { self.name } else { None };
        Self {
            name,
            label_selectors: Arc::new(selectors),
        }
    }

    /// Name (when set) must equal exactly; every selector must be present
    /// with an equal value. Labels beyond the selectors are ignored.
    pub fn matches(&self, metadata: &ObjectMeta) -> bool {
        if let Some(name) = self.name.as_deref() {
            if metadata.name.as_deref() != Some(name) {
                return false;
            }
        }
        match metadata.labels.as_ref() {
            None => self.label_selectors.is_empty(),
            Some(labels) => self
                .label_selectors
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value)),
        }
    }
}

fn normalize_name(name: Option<String>) -> Option<String> {
    name.filter(|n| !n.trim().is_empty())
}

/// Every selector in `left` appears in `right` (key compared without case).
fn selectors_covered(left: &Labels, right: &Labels) -> bool {
    left.iter().all(|(key, value)| {
        right
            .iter()
            .any(|(other_key, other_value)| other_key.eq_ignore_ascii_case(key) && other_value == value)
    })
}

fn selectors_equivalent(left: &Labels, right: &Labels) -> bool {
    selectors_covered(left, right) && selectors_covered(right, left)
}

impl PartialEq for ResourceEventFilter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && selectors_equivalent(&self.label_selectors, &other.label_selectors)
    }
}

impl Eq for ResourceEventFilter {}

impl Hash for ResourceEventFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        // Lowercased and deduplicated so filters equal under `eq` hash alike.
        let normalized: BTreeMap<String, Vec<&String>> =
            self.label_selectors
                .iter()
                .fold(BTreeMap::new(), |mut acc, (key, value)| {
                    acc.entry(key.to_ascii_lowercase()).or_default().push(value);
                    acc
                });
        for (key, mut values) in normalized {
            values.sort();
            values.dedup();
            key.hash(state);
            values.hash(state);
        }
    }
}

impl fmt::Display for ResourceEventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .label_selectors
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        match (&self.name, rendered.is_empty()) {
            (None, true) => f.write_str("*"),
            (Some(name), true) => write!(f, "name={name}"),
            (None, false) => write!(f, "labels{{{}}}", rendered.join(",")),
            (Some(name), false) => write!(f, "name={name} labels{{{}}}", rendered.join(",")),
        }
    }
}
