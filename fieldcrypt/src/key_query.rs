//! Key-vault queries emitted by requests that are gathering keys.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use crate::key_id::{KeyId, KeyReference};
use crate::options::KeyVaultNamespace;

/// A request for key records that the caller runs against the key vault.
///
/// A query names only references that were unresolved when it was planned,
/// and no reference appears in two queries of the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyQuery {
    sequence: usize,
    namespace: KeyVaultNamespace,
    ids: Vec<KeyId>,
    alt_names: Vec<String>,
}

impl KeyQuery {
    /// Splits `unresolved` into queries of at most `batch_size` references.
    pub(crate) fn plan(
        namespace: &KeyVaultNamespace,
        unresolved: &BTreeSet<KeyReference>,
        batch_size: Option<NonZeroUsize>,
    ) -> Vec<Self> {
        if unresolved.is_empty() {
            return Vec::new();
        }

        let references: Vec<&KeyReference> = unresolved.iter().collect();
        let chunk = batch_size.map_or(references.len(), NonZeroUsize::get);

        references
            .chunks(chunk)
            .enumerate()
            .map(|(sequence, chunk)| {
                let mut query = Self {
                    sequence,
                    namespace: namespace.clone(),
                    ids: Vec::new(),
                    alt_names: Vec::new(),
                };
                for reference in chunk {
                    match reference {
                        KeyReference::Id(id) => query.ids.push(id.clone()),
                        KeyReference::AltName(name) => query.alt_names.push(name.clone()),
                    }
                }
                query
            })
            .collect()
    }

    /// Position of this query within its request, starting at 0.
    #[must_use]
    pub const fn sequence(&self) -> usize {
        self.sequence
    }

    /// Key-vault collection to query.
    #[must_use]
    pub const fn namespace(&self) -> &KeyVaultNamespace {
        &self.namespace
    }

    /// Key ids requested.
    #[must_use]
    pub fn ids(&self) -> &[KeyId] {
        &self.ids
    }

    /// Alternate names requested.
    #[must_use]
    pub fn alt_names(&self) -> &[String] {
        &self.alt_names
    }

    /// Every reference named by this query.
    pub fn references(&self) -> impl Iterator<Item = KeyReference> + '_ {
        self.ids
            .iter()
            .cloned()
            .map(KeyReference::Id)
            .chain(self.alt_names.iter().cloned().map(KeyReference::AltName))
    }

    /// Returns true if a record with this id and these alt names answers the query.
    #[must_use]
    pub fn matches(&self, id: &str, alt_names: &[String]) -> bool {
        self.ids.iter().any(|k| k.as_str() == id)
            || alt_names.iter().any(|name| self.alt_names.contains(name))
    }

    /// Renders the key-vault filter.
    ///
    /// ```text
    /// {"$or": [{"_id": {"$in": [...]}}, {"keyAltNames": {"$in": [...]}}]}
    /// ```
    ///
    /// Arms with nothing to match are left out.
    #[must_use]
    pub fn filter(&self) -> Value {
        let mut arms = Vec::with_capacity(2);
        if !self.ids.is_empty() {
            let ids: Vec<&str> = self.ids.iter().map(KeyId::as_str).collect();
            arms.push(json!({"_id": {"$in": ids}}));
        }
        if !self.alt_names.is_empty() {
            arms.push(json!({"keyAltNames": {"$in": self.alt_names}}));
        }
        json!({"$or": arms})
    }

    /// Serializes the filter to a compact buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.filter().to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> KeyVaultNamespace {
        "admin.datakeys".parse().unwrap()
    }

    fn references(specs: &[&str]) -> BTreeSet<KeyReference> {
        specs
            .iter()
            .map(|s| match s.strip_prefix('@') {
                Some(name) => KeyReference::alt_name(name).unwrap(),
                None => KeyReference::id(*s).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_single_query_by_default() {
        let unresolved = references(&["K1", "K2", "@payroll"]);
        let queries = KeyQuery::plan(&namespace(), &unresolved, None);

        assert_eq!(queries.len(), 1);
        let query = &queries[0];
        assert_eq!(query.sequence(), 0);
        assert_eq!(query.ids().len(), 2);
        assert_eq!(query.alt_names(), ["payroll"]);
        assert_eq!(query.namespace().to_string(), "admin.datakeys");
    }

    #[test]
    fn test_no_references_no_queries() {
        assert!(KeyQuery::plan(&namespace(), &BTreeSet::new(), None).is_empty());
    }

    #[test]
    fn test_batching_partitions_references() {
        let unresolved = references(&["K1", "K2", "K3", "K4", "K5"]);
        let queries = KeyQuery::plan(&namespace(), &unresolved, NonZeroUsize::new(2));

        assert_eq!(queries.len(), 3);
        assert_eq!(queries.iter().map(|q| q.ids().len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(queries[2].sequence(), 2);

        let union: BTreeSet<KeyReference> = queries.iter().flat_map(|q| q.references()).collect();
        assert_eq!(union, unresolved);
    }

    #[test]
    fn test_filter_shape() {
        let queries = KeyQuery::plan(&namespace(), &references(&["K1", "@payroll"]), None);
        assert_eq!(
            queries[0].filter(),
            json!({"$or": [
                {"_id": {"$in": ["K1"]}},
                {"keyAltNames": {"$in": ["payroll"]}}
            ]})
        );
    }

    #[test]
    fn test_filter_omits_empty_arms() {
        let queries = KeyQuery::plan(&namespace(), &references(&["K1"]), None);
        assert_eq!(queries[0].filter(), json!({"$or": [{"_id": {"$in": ["K1"]}}]}));
        assert_eq!(queries[0].to_bytes(), br#"{"$or":[{"_id":{"$in":["K1"]}}]}"#.to_vec());
    }

    #[test]
    fn test_matches_record() {
        let query = &KeyQuery::plan(&namespace(), &references(&["K1", "@payroll"]), None)[0];

        assert!(query.matches("K1", &[]));
        assert!(query.matches("K7", &["payroll".to_string()]));
        assert!(!query.matches("K7", &["hr".to_string()]));
    }
}
