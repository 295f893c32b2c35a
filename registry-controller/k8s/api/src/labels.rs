use std::{collections::BTreeMap, sync::Arc};

/// An immutable, cheaply cloned set of labels.
///
/// Service selectors are represented as labels too: a selector matches a
/// workload when it is a [subset](Labels::subset_of) of the workload's labels.
#[derive(Clone, Debug, Eq, Default, Hash)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

// === Labels ===

impl Labels {
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if every label in `self` is also set, with the same value,
    /// in `other`. The empty set is a subset of everything.
    pub fn subset_of(&self, other: &Labels) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        &self.0
    }
}

impl<T: AsRef<Map>> PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, other: &T) -> bool {
        *self.0 == *other.as_ref()
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_subsets() {
        let workload = Labels::from_iter([("app", "prod-app"), ("istio-locality", "r.z")]);
        for (selector, matches, msg) in [
            (Labels::default(), true, "empty selector"),
            (Labels::from_iter([("app", "prod-app")]), true, "sufficient match"),
            (
                Labels::from_iter([("app", "prod-app"), ("istio-locality", "r.z")]),
                true,
                "exact match",
            ),
            (Labels::from_iter([("app", "test-app")]), false, "value mismatch"),
            (
                Labels::from_iter([("app", "prod-app"), ("env", "prod")]),
                false,
                "missing key",
            ),
        ] {
            assert_eq!(selector.subset_of(&workload), matches, "{msg}");
        }
    }

    #[test]
    fn compares_with_maps() {
        let labels = Labels::from(Some(Map::from([("a".to_string(), "1".to_string())])));
        assert_eq!(labels.as_ref(), &Map::from([("a".to_string(), "1".to_string())]));
        assert!(Labels::from(None).is_empty());
    }
}
