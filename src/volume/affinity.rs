//! Node affinity and cleanup eligibility

use super::{storage_class_name, volume_name};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolume, VolumeNodeAffinity,
};
use std::collections::BTreeSet;

const OPERATOR_IN: &str = "In";

/// Required affinity pinning a volume to the node labelled `key=value`
pub fn node_affinity_for(key: &str, value: &str) -> VolumeNodeAffinity {
    VolumeNodeAffinity {
        required: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: key.to_string(),
                    operator: OPERATOR_IN.to_string(),
                    values: Some(vec![value.to_string()]),
                }]),
                match_fields: None,
            }],
        }),
    }
}

/// Node names a volume's required affinity selects through `label_key`.
///
/// Expressions within a term are ANDed, so their value sets intersect; terms
/// are ORed, so the per-term results are unioned.
pub fn node_names_from_affinity(pv: &PersistentVolume, label_key: &str) -> Vec<String> {
    let terms = match pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
    {
        Some(selector) => &selector.node_selector_terms,
        None => return Vec::new(),
    };

    let mut names = BTreeSet::new();
    for term in terms {
        let mut term_names: Option<BTreeSet<String>> = None;
        for expr in term.match_expressions.iter().flatten() {
            if expr.key != label_key || expr.operator != OPERATOR_IN {
                continue;
            }
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            term_names = Some(match term_names {
                Some(existing) => existing.intersection(&values).cloned().collect(),
                None => values,
            });
        }
        names.extend(term_names.unwrap_or_default());
    }
    names.into_iter().collect()
}

/// The single node a local volume is pinned to.
///
/// Zero or several candidate nodes is a malformed affinity and the volume
/// must be left alone.
pub fn node_attached_to_local_pv(pv: &PersistentVolume, label_key: &str) -> Result<String> {
    let mut names = node_names_from_affinity(pv, label_key);
    match names.len() {
        1 => Ok(names.remove(0)),
        n => Err(Error::MalformedAffinity {
            volume: volume_name(pv).to_string(),
            reason: format!("expected exactly one node for {}, found {}", label_key, n),
        }),
    }
}

/// Whether `pv` is a local volume of one of the given StorageClasses
pub fn is_local_pv_with_storage_class(pv: &PersistentVolume, storage_class_names: &[String]) -> bool {
    let is_local = pv.spec.as_ref().map_or(false, |s| s.local.is_some());
    if !is_local {
        return false;
    }
    match storage_class_name(pv) {
        Some(class) => storage_class_names.iter().any(|name| name == class),
        None => false,
    }
}
