//! Tracking of names that need external DNS resolution.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// A set of DNS names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameSet(HashSet<String>);

/// Identifies the subsystem that asked for a set of names to be watched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Referer {
    pub source: String,
    pub kind: String,
    pub name: String,
}

/// Resolves watched names on behalf of referers.
///
/// Each referer owns its list of names; a name stays watched while any referer
/// still lists it. Calls are made outside of any index lock.
pub trait DnsResolver: Send + Sync {
    /// Replaces the names watched on behalf of `referer`.
    fn watch(&self, referer: Referer, names: Vec<String>);

    /// Drops every name watched on behalf of `referer`.
    fn cancel(&self, referer: &Referer);
}

/// Reference-counts names across referers.
#[derive(Debug, Default)]
pub struct WatchTable {
    by_referer: HashMap<Referer, NameSet>,
    counts: HashMap<String, usize>,
}

/// The effect of a [`WatchTable`] update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchDelta {
    /// Names that were not watched by any referer before the update.
    pub watched: Vec<String>,
    /// Names that no referer watches anymore.
    pub unwatched: Vec<String>,
}

// === impl NameSet ===

impl NameSet {
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the names in sorted order.
    pub fn list(&self) -> Vec<String> {
        let mut names = self.0.iter().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Returns `(added, deleted)`: the sorted names only in `self`, and the
    /// sorted names only in `prior`.
    pub fn diff(&self, prior: &NameSet) -> (Vec<String>, Vec<String>) {
        let mut added = self.0.difference(&prior.0).cloned().collect::<Vec<_>>();
        let mut deleted = prior.0.difference(&self.0).cloned().collect::<Vec<_>>();
        added.sort();
        deleted.sort();
        (added, deleted)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for NameSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// === impl Referer ===

impl Referer {
    pub fn new(source: impl ToString, kind: impl ToString, name: impl ToString) -> Self {
        Self {
            source: source.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

// === impl WatchTable ===

impl WatchTable {
    pub fn watch(&mut self, referer: Referer, names: NameSet) -> WatchDelta {
        let prior = self.by_referer.remove(&referer).unwrap_or_default();
        let (added, removed) = names.diff(&prior);
        if !names.is_empty() {
            self.by_referer.insert(referer, names);
        }
        self.apply(added, removed)
    }

    pub fn cancel(&mut self, referer: &Referer) -> WatchDelta {
        match self.by_referer.remove(referer) {
            Some(prior) => self.apply(Vec::new(), prior.list()),
            None => WatchDelta::default(),
        }
    }

    pub fn is_watched(&self, name: &str) -> bool {
        self.counts.contains_key(name)
    }

    /// All watched names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.counts.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn apply(&mut self, added: Vec<String>, removed: Vec<String>) -> WatchDelta {
        let mut delta = WatchDelta::default();
        for name in added {
            let count = self.counts.entry(name.clone()).or_default();
            *count += 1;
            if *count == 1 {
                delta.watched.push(name);
            }
        }
        for name in removed {
            if let Some(count) = self.counts.get_mut(&name) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&name);
                    delta.unwatched.push(name);
                }
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_set_diff() {
        let prior = ["a.example.com", "b.example.com"]
            .into_iter()
            .collect::<NameSet>();
        let next = ["b.example.com", "c.example.com"]
            .into_iter()
            .collect::<NameSet>();
        let (added, deleted) = next.diff(&prior);
        assert_eq!(added, vec!["c.example.com"]);
        assert_eq!(deleted, vec!["a.example.com"]);

        let (added, deleted) = next.diff(&next.clone());
        assert!(added.is_empty() && deleted.is_empty());
    }

    #[test]
    fn name_set_list_is_sorted() {
        let mut names = NameSet::default();
        assert!(names.insert("z"));
        assert!(names.insert("a"));
        assert!(!names.insert("a"));
        assert_eq!(names.list(), vec!["a", "z"]);
        assert!(names.remove("z"));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn watch_table_refcounts_across_referers() {
        let mesh = Referer::new("istio.mesh", "MeshNetworks", "");
        let svc = Referer::new("k8s", "Service", "gw.ns.svc.cluster.local");
        let mut table = WatchTable::default();

        let delta = table.watch(mesh.clone(), ["gw.example.com"].into_iter().collect());
        assert_eq!(delta.watched, vec!["gw.example.com"]);

        // A second referer for the same name does not re-watch it.
        let delta = table.watch(
            svc.clone(),
            ["gw.example.com", "lb.example.com"].into_iter().collect(),
        );
        assert_eq!(delta.watched, vec!["lb.example.com"]);

        // The name survives while the service still refers to it.
        let delta = table.cancel(&mesh);
        assert_eq!(delta, WatchDelta::default());
        assert!(table.is_watched("gw.example.com"));

        let delta = table.cancel(&svc);
        assert_eq!(delta.unwatched, vec!["gw.example.com", "lb.example.com"]);
        assert!(table.names().is_empty());
    }

    #[test]
    fn watch_table_replaces_names() {
        let r = Referer::new("MeshNetworks", "Service", "a");
        let mut table = WatchTable::default();
        table.watch(r.clone(), ["x", "y"].into_iter().collect());
        let delta = table.watch(r.clone(), ["y", "z"].into_iter().collect());
        assert_eq!(delta.watched, vec!["z"]);
        assert_eq!(delta.unwatched, vec!["x"]);

        let delta = table.watch(r, NameSet::default());
        assert_eq!(delta.unwatched, vec!["y", "z"]);
    }
}
