//! kcopy order: kind priority table and upload wave planning.
//!
//! Kinds that other objects depend on (namespaces, priority classes, CRDs) get a lower rank and
//! are uploaded in earlier waves. Kinds missing from the table go into one trailing wave.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Built-in dependency ranks for well-known kinds.
pub const WELL_KNOWN: &[(&str, u32)] = &[
    ("CustomResourceDefinition", 0),
    ("Namespace", 0),
    ("PriorityClass", 0),
    ("StorageClass", 0),
    ("RuntimeClass", 0),
    ("IngressClass", 0),
    ("CSIDriver", 0),
    ("APIService", 0),
    ("ServiceAccount", 1),
    ("ClusterRole", 1),
    ("Role", 1),
    ("ConfigMap", 1),
    ("Secret", 1),
    ("LimitRange", 1),
    ("ResourceQuota", 1),
    ("PersistentVolume", 1),
    ("Node", 1),
    ("CSINode", 1),
    ("VolumeAttachment", 1),
    ("ClusterRoleBinding", 2),
    ("RoleBinding", 2),
    ("PersistentVolumeClaim", 2),
    ("Service", 2),
    ("NetworkPolicy", 2),
    ("MutatingWebhookConfiguration", 2),
    ("ValidatingWebhookConfiguration", 2),
    ("Deployment", 3),
    ("StatefulSet", 3),
    ("DaemonSet", 3),
    ("ReplicaSet", 3),
    ("ReplicationController", 3),
    ("Job", 3),
    ("CronJob", 3),
    ("Pod", 3),
    ("PodDisruptionBudget", 4),
    ("HorizontalPodAutoscaler", 4),
    ("Endpoints", 4),
    ("EndpointSlice", 4),
    ("Ingress", 4),
];

/// Kind name -> rank. Lower ranks are uploaded first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityTable {
    ranks: FxHashMap<String, u32>,
}

impl PriorityTable {
    pub fn well_known() -> Self {
        Self::from_entries(WELL_KNOWN.iter().map(|(k, r)| (*k, *r)))
    }

    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, u32)>) -> Self {
        Self { ranks: entries.into_iter().map(|(k, r)| (k.into(), r)).collect() }
    }

    pub fn rank(&self, kind: &str) -> Option<u32> { self.ranks.get(kind).copied() }

    pub fn len(&self) -> usize { self.ranks.len() }

    pub fn is_empty(&self) -> bool { self.ranks.is_empty() }
}

/// Kinds processed together; waves run strictly one after another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// `None` for the trailing wave of kinds the table does not know (and for unordered runs).
    pub rank: Option<u32>,
    pub kinds: Vec<String>,
}

impl Wave {
    pub fn contains(&self, kind: &str) -> bool { self.kinds.iter().any(|k| k == kind) }
}

/// Partition `kinds` into waves.
///
/// Without ordering there is a single wave holding every kind. With ordering there is one wave
/// per populated rank in ascending order, followed by the unknown kinds. Kinds inside a wave are
/// sorted and deduplicated, so the partition depends only on the kind set.
pub fn plan_waves<S: AsRef<str>>(kinds: &[S], order: bool, table: &PriorityTable) -> Vec<Wave> {
    let mut all: Vec<String> = kinds.iter().map(|k| k.as_ref().to_string()).collect();
    all.sort();
    all.dedup();
    if all.is_empty() {
        return Vec::new();
    }
    if !order {
        return vec![Wave { rank: None, kinds: all }];
    }
    let mut ranked: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    let mut unknown = Vec::new();
    for kind in all {
        match table.rank(&kind) {
            Some(r) => ranked.entry(r).or_default().push(kind),
            None => unknown.push(kind),
        }
    }
    let mut waves: Vec<Wave> = ranked.into_iter().map(|(rank, kinds)| Wave { rank: Some(rank), kinds }).collect();
    if !unknown.is_empty() {
        waves.push(Wave { rank: None, kinds: unknown });
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(waves: &[Wave], kind: &str) -> usize {
        waves.iter().position(|w| w.contains(kind)).unwrap_or_else(|| panic!("{kind} missing"))
    }

    #[test]
    fn unordered_is_single_wave() {
        let waves = plan_waves(&["Namespace", "Pod"], false, &PriorityTable::well_known());
        assert_eq!(waves, vec![Wave { rank: None, kinds: vec!["Namespace".into(), "Pod".into()] }]);
    }

    #[test]
    fn ordered_puts_namespace_and_priority_class_before_pod() {
        let waves = plan_waves(&["Pod", "Namespace", "PriorityClass"], true, &PriorityTable::well_known());
        let pod = position(&waves, "Pod");
        assert!(position(&waves, "Namespace") < pod);
        assert!(position(&waves, "PriorityClass") < pod);
    }

    #[test]
    fn unknown_kinds_trail_after_crds() {
        let waves = plan_waves(&["Widget", "CustomResourceDefinition", "Gadget", "Pod"], true, &PriorityTable::well_known());
        let last = waves.last().unwrap();
        assert_eq!(last.rank, None);
        assert_eq!(last.kinds, vec!["Gadget".to_string(), "Widget".to_string()]);
        assert!(position(&waves, "CustomResourceDefinition") < position(&waves, "Widget"));
    }

    #[test]
    fn every_kind_lands_in_exactly_one_wave() {
        let table = PriorityTable::well_known();
        let mut kinds: Vec<&str> = WELL_KNOWN.iter().map(|(k, _)| *k).collect();
        kinds.extend(["Widget", "Pod", "Namespace"]);
        for order in [true, false] {
            let waves = plan_waves(&kinds, order, &table);
            let mut seen: Vec<String> = waves.iter().flat_map(|w| w.kinds.clone()).collect();
            let n = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), n, "duplicate kind across waves");
            assert_eq!(n, WELL_KNOWN.len() + 1);
        }
    }

    #[test]
    fn known_dependencies_hold() {
        let table = PriorityTable::well_known();
        let kinds: Vec<&str> = WELL_KNOWN.iter().map(|(k, _)| *k).collect();
        let waves = plan_waves(&kinds, true, &table);
        for (before, after) in [
            ("Namespace", "ConfigMap"),
            ("Namespace", "Pod"),
            ("PriorityClass", "Pod"),
            ("ServiceAccount", "Pod"),
            ("PersistentVolumeClaim", "Pod"),
            ("Node", "Pod"),
            ("StorageClass", "PersistentVolumeClaim"),
            ("Role", "RoleBinding"),
            ("Deployment", "HorizontalPodAutoscaler"),
            ("Pod", "PodDisruptionBudget"),
        ] {
            assert!(position(&waves, before) < position(&waves, after), "{before} should precede {after}");
        }
    }

    #[test]
    fn planning_is_deterministic() {
        let table = PriorityTable::well_known();
        let a = plan_waves(&["Pod", "Widget", "Namespace", "Service", "Pod"], true, &table);
        let b = plan_waves(&["Namespace", "Service", "Widget", "Pod"], true, &table);
        assert_eq!(a, b);
    }

    #[test]
    fn injected_table_overrides_ranks() {
        let table = PriorityTable::from_entries([("Pod", 0u32), ("Namespace", 1)]);
        let waves = plan_waves(&["Namespace", "Pod"], true, &table);
        assert_eq!(waves[0].kinds, vec!["Pod".to_string()]);
        assert!(plan_waves::<&str>(&[], true, &table).is_empty());
    }
}
