//! VM identifiers: ordered label paths scoping visibility and delegation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered sequence of UTF-8 labels forming a path, e.g.
/// `tenant/group/vm`. The issuer chain of a client certificate yields the
/// *prefix*; the leaf common name is the *name*; a VM's full id is
/// prefix + name. Ids are unique among live VMs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(Vec<String>);

impl VmId {
    /// The empty path. As a prefix it scopes everything.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(labels: Vec<String>) -> Self {
        Self(labels)
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The final label, if any.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// This path extended by one label.
    pub fn child(&self, label: impl Into<String>) -> Self {
        let mut labels = self.0.clone();
        labels.push(label.into());
        Self(labels)
    }

    /// This path extended by a relative path.
    pub fn join(&self, rel: &[String]) -> Self {
        let mut labels = self.0.clone();
        labels.extend(rel.iter().cloned());
        Self(labels)
    }

    /// Whether `prefix` is a (non-strict) prefix of this path.
    pub fn starts_with(&self, prefix: &VmId) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// All proper ancestor prefixes, outermost first (excludes the empty
    /// root and this path itself).
    pub fn ancestors(&self) -> impl Iterator<Item = VmId> + '_ {
        (1..self.0.len()).map(|n| VmId(self.0[..n].to_vec()))
    }

    /// A filesystem-safe name for per-VM files in the working directory.
    pub fn file_stem(&self) -> String {
        self.0.join(".")
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0.join("/"))
        }
    }
}

impl From<Vec<String>> for VmId {
    fn from(labels: Vec<String>) -> Self {
        Self(labels)
    }
}

impl From<VmId> for Vec<String> {
    fn from(id: VmId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(parts: &[&str]) -> VmId {
        VmId::new(parts.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn prefix_relation() {
        let vm = id(&["tenant", "group", "vm"]);
        assert!(vm.starts_with(&VmId::root()));
        assert!(vm.starts_with(&id(&["tenant"])));
        assert!(vm.starts_with(&id(&["tenant", "group"])));
        assert!(vm.starts_with(&vm));
        assert!(!vm.starts_with(&id(&["other"])));
        assert!(!id(&["tenant"]).starts_with(&vm));
    }

    #[test]
    fn ancestors_are_proper_and_ordered() {
        let vm = id(&["a", "b", "c"]);
        let anc: Vec<VmId> = vm.ancestors().collect();
        assert_eq!(anc, vec![id(&["a"]), id(&["a", "b"])]);
        assert!(id(&["a"]).ancestors().next().is_none());
    }

    #[test]
    fn display_and_name() {
        let vm = id(&["tenant", "vm1"]);
        assert_eq!(vm.to_string(), "tenant/vm1");
        assert_eq!(vm.name(), Some("vm1"));
        assert_eq!(VmId::root().to_string(), "/");
        assert_eq!(vm.file_stem(), "tenant.vm1");
    }

    #[test]
    fn join_is_relative() {
        let prefix = id(&["tenant"]);
        let full = prefix.join(&["group".into(), "vm".into()]);
        assert_eq!(full, id(&["tenant", "group", "vm"]));
    }
}
