//! Encryption schemas and the matcher that applies them to commands.
//!
//! A schema mirrors the command it applies to. Every node is either a nested
//! object keyed by command field names, or a leaf carrying `$encrypt`:
//!
//! ```text
//! {
//!   "filter": {
//!     "name": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}},
//!     "ssn":  {"$encrypt": {"algorithm": "Deterministic", "keyAltName": "payroll"}}
//!   }
//! }
//! ```
//!
//! A leaf without `keyId`/`keyAltName` uses the context's default key.
//! Where the command holds an array under a nested node, the node applies to
//! every element, so `{"documents": {"ssn": ...}}` covers an insert.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::document::{is_encrypted, FieldPath, PathSegment};
use crate::envelope::ValueType;
use crate::error::Error;
use crate::key_id::KeyReference;

const ENCRYPT_MARKER: &str = "$encrypt";

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Same plaintext and key give the same envelope; supports equality queries.
    Deterministic,
    /// Fresh nonce per encryption; no query support.
    Random,
}

impl Algorithm {
    /// Returns the envelope tag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    /// Parses an envelope tag byte.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }

    /// Returns true if values of this type may be encrypted with this algorithm.
    #[must_use]
    pub const fn accepts(self, value_type: ValueType) -> bool {
        match self {
            Self::Deterministic => matches!(value_type, ValueType::String | ValueType::Int64),
            Self::Random => !matches!(value_type, ValueType::Null),
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "Deterministic" | "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic" => {
                Ok(Self::Deterministic)
            }
            "Random" | "AEAD_AES_256_CBC_HMAC_SHA_512-Random" => Ok(Self::Random),
            other => Err(Error::Schema(format!("unknown algorithm: '{other}'"))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("Deterministic"),
            Self::Random => f.write_str("Random"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyIdSpec {
    One(String),
    List(Vec<String>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EncryptSpec {
    algorithm: String,
    #[serde(default)]
    key_id: Option<KeyIdSpec>,
    #[serde(default)]
    key_alt_name: Option<String>,
}

/// Encryption declared for one leaf field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    algorithm: Algorithm,
    key: Option<KeyReference>,
}

impl FieldSpec {
    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the explicit key, or `None` for the default key.
    #[must_use]
    pub const fn key(&self) -> Option<&KeyReference> {
        self.key.as_ref()
    }

    fn parse(spec: &Value, path: &FieldPath) -> Result<Self, Error> {
        let spec = EncryptSpec::deserialize(spec)
            .map_err(|e| Error::Schema(format!("invalid $encrypt at '{path}': {e}")))?;
        let algorithm = spec.algorithm.parse::<Algorithm>()?;

        let key_id = match spec.key_id {
            None => None,
            Some(KeyIdSpec::One(id)) => Some(id),
            Some(KeyIdSpec::List(mut ids)) if ids.len() == 1 => ids.pop(),
            Some(KeyIdSpec::List(ids)) => {
                return Err(Error::Schema(format!(
                    "keyId at '{path}' must name exactly one key, got {}",
                    ids.len()
                )));
            }
        };

        let key = match (key_id, spec.key_alt_name) {
            (Some(_), Some(_)) => {
                return Err(Error::Schema(format!(
                    "'{path}' declares both keyId and keyAltName"
                )));
            }
            (Some(id), None) => Some(KeyReference::id(id)),
            (None, Some(name)) => Some(KeyReference::alt_name(name)),
            (None, None) => None,
        }
        .transpose()
        .map_err(|e| Error::Schema(format!("invalid key at '{path}': {e}")))?;

        Ok(Self { algorithm, key })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemaNode {
    Leaf(FieldSpec),
    Nested(Vec<(String, SchemaNode)>),
}

impl SchemaNode {
    fn parse(value: &Value, path: &mut FieldPath) -> Result<Self, Error> {
        let Some(fields) = value.as_object() else {
            return Err(Error::Schema(format!("schema node at '{path}' is not a document")));
        };

        if let Some(spec) = fields.get(ENCRYPT_MARKER) {
            if fields.len() != 1 {
                return Err(Error::Schema(format!(
                    "'{path}' mixes $encrypt with nested fields"
                )));
            }
            return FieldSpec::parse(spec, path).map(Self::Leaf);
        }

        let mut children = Vec::with_capacity(fields.len());
        for (name, child) in fields {
            if name.starts_with('$') {
                return Err(Error::Schema(format!("unknown schema keyword '{name}' at '{path}'")));
            }
            path.push(PathSegment::Key(name.clone()));
            let node = Self::parse(child, path)?;
            path.pop();
            children.push((name.clone(), node));
        }
        Ok(Self::Nested(children))
    }
}

/// A parsed encryption schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, SchemaNode)>,
}

impl Schema {
    /// Parses a schema from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if the value is not a valid schema.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let mut path = FieldPath::root();
        match SchemaNode::parse(value, &mut path)? {
            SchemaNode::Nested(fields) => Ok(Self { fields }),
            SchemaNode::Leaf(_) => {
                Err(Error::Schema("the command root cannot be encrypted".to_string()))
            }
        }
    }

    /// Parses a schema from a JSON buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if the buffer is not a valid schema.
    pub fn from_slice(buffer: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(buffer)
            .map_err(|e| Error::Schema(format!("schema is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }
}

/// A command field that must be encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedField {
    /// Location of the value in the command
    pub path: FieldPath,
    /// Key to encrypt with
    pub key: KeyReference,
    /// Algorithm to encrypt with
    pub algorithm: Algorithm,
}

/// Applies `schema` to `command`.
///
/// Output follows the command's field order. Leaves without an explicit key
/// use `default_key`.
///
/// # Errors
///
/// Returns `Error::Schema` if:
/// - A schema field is missing from the command
/// - A nested schema node meets a non-document value
/// - A value cannot be encrypted with its algorithm, or is already encrypted
/// - A leaf has no key and there is no default key
pub fn match_fields(
    schema: &Schema,
    command: &Value,
    default_key: Option<&KeyReference>,
) -> Result<Vec<MatchedField>, Error> {
    let mut matcher = Matcher { default_key, matched: Vec::new(), path: FieldPath::root() };
    matcher.walk_document(&schema.fields, command)?;
    Ok(matcher.matched)
}

struct Matcher<'a> {
    default_key: Option<&'a KeyReference>,
    matched: Vec<MatchedField>,
    path: FieldPath,
}

impl Matcher<'_> {
    fn walk_document(
        &mut self,
        nodes: &[(String, SchemaNode)],
        value: &Value,
    ) -> Result<(), Error> {
        let Some(fields) = value.as_object() else {
            return Err(Error::Schema(format!(
                "schema expects a document at '{}'",
                self.path
            )));
        };

        if let Some((missing, _)) = nodes.iter().find(|(name, _)| !fields.contains_key(name)) {
            let path = self.path.clone().key(missing.as_str());
            return Err(Error::Schema(format!("field '{path}' is missing from the command")));
        }

        for (name, child) in fields {
            if let Some((_, node)) = nodes.iter().find(|(n, _)| n == name) {
                self.path.push(PathSegment::Key(name.clone()));
                self.visit(node, child)?;
                self.path.pop();
            }
        }
        Ok(())
    }

    fn visit(&mut self, node: &SchemaNode, value: &Value) -> Result<(), Error> {
        match (node, value) {
            (SchemaNode::Leaf(spec), _) => self.match_leaf(spec, value),
            (SchemaNode::Nested(_), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.path.push(PathSegment::Index(i));
                    self.visit(node, item)?;
                    self.path.pop();
                }
                Ok(())
            }
            (SchemaNode::Nested(children), _) => self.walk_document(children, value),
        }
    }

    fn match_leaf(&mut self, spec: &FieldSpec, value: &Value) -> Result<(), Error> {
        if is_encrypted(value) {
            return Err(Error::Schema(format!("field '{}' is already encrypted", self.path)));
        }

        let value_type = ValueType::of(value);
        if !spec.algorithm.accepts(value_type) {
            return Err(Error::Schema(format!(
                "{} encryption does not support {value_type:?} values (field '{}')",
                spec.algorithm, self.path
            )));
        }

        let key = spec.key.as_ref().or(self.default_key).cloned().ok_or_else(|| {
            Error::Schema(format!("field '{}' has no key and no default key is set", self.path))
        })?;

        self.matched.push(MatchedField { path: self.path.clone(), key, algorithm: spec.algorithm });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn k1() -> KeyReference {
        KeyReference::id("K1").unwrap()
    }

    fn scenario_schema() -> Schema {
        Schema::from_value(&json!({
            "filter": {
                "name": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}},
                "ssn": {"$encrypt": {"algorithm": "Deterministic", "keyId": "K1"}},
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_match_find_command() {
        let command = json!({
            "find": "collection",
            "filter": {"name": "Todd Davis", "ssn": "457-55-5642"}
        });
        let matched = match_fields(&scenario_schema(), &command, None).unwrap();

        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].path.to_string(), "filter.name");
        assert_eq!(matched[0].algorithm, Algorithm::Random);
        assert_eq!(matched[1].path.to_string(), "filter.ssn");
        assert_eq!(matched[1].algorithm, Algorithm::Deterministic);
        assert!(matched.iter().all(|m| m.key == k1()));
    }

    #[test]
    fn test_output_follows_command_order() {
        let command = json!({"filter": {"ssn": "457-55-5642", "name": "Todd Davis"}});
        let matched = match_fields(&scenario_schema(), &command, None).unwrap();

        let paths: Vec<String> = matched.iter().map(|m| m.path.to_string()).collect();
        assert_eq!(paths, vec!["filter.ssn", "filter.name"]);
    }

    #[test]
    fn test_missing_field_is_schema_error() {
        let command = json!({"find": "collection", "filter": {"name": "Todd Davis"}});
        let err = match_fields(&scenario_schema(), &command, None).unwrap_err();

        assert!(matches!(&err, Error::Schema(msg) if msg.contains("filter.ssn")));
    }

    #[test]
    fn test_unknown_algorithm_is_schema_error() {
        let result = Schema::from_value(&json!({"ssn": {"$encrypt": {"algorithm": "Sloppy"}}}));
        assert!(matches!(result, Err(Error::Schema(msg)) if msg.contains("Sloppy")));
    }

    #[test]
    fn test_long_algorithm_names_accepted() {
        let schema = Schema::from_value(&json!({
            "a": {"$encrypt": {
                "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
                "keyId": ["K1"]
            }},
            "b": {"$encrypt": {"algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random", "keyId": "K1"}},
        }))
        .unwrap();
        let matched = match_fields(&schema, &json!({"a": "x", "b": "y"}), None).unwrap();

        assert_eq!(matched[0].algorithm, Algorithm::Deterministic);
        assert_eq!(matched[1].algorithm, Algorithm::Random);
    }

    #[test]
    fn test_arrays_apply_nested_schema_to_every_element() {
        let schema = Schema::from_value(&json!({
            "documents": {
                "ssn": {"$encrypt": {"algorithm": "Deterministic", "keyAltName": "payroll"}}
            }
        }))
        .unwrap();
        let command = json!({"insert": "people", "documents": [{"ssn": "1"}, {"ssn": "2"}]});
        let matched = match_fields(&schema, &command, None).unwrap();

        let paths: Vec<String> = matched.iter().map(|m| m.path.to_string()).collect();
        assert_eq!(paths, vec!["documents.0.ssn", "documents.1.ssn"]);
        assert_eq!(matched[0].key, KeyReference::AltName("payroll".into()));
    }

    #[test]
    fn test_default_key_used_when_leaf_has_none() {
        let schema =
            Schema::from_value(&json!({"ssn": {"$encrypt": {"algorithm": "Random"}}})).unwrap();
        let command = json!({"ssn": "457-55-5642"});

        let matched = match_fields(&schema, &command, Some(&k1())).unwrap();
        assert_eq!(matched[0].key, k1());

        let err = match_fields(&schema, &command, None).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_both_key_forms_rejected() {
        let result = Schema::from_value(&json!({
            "ssn": {"$encrypt": {"algorithm": "Random", "keyId": "K1", "keyAltName": "x"}}
        }));
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_unknown_spec_field_rejected() {
        let result = Schema::from_value(&json!({
            "ssn": {"$encrypt": {"algorithm": "Random", "keyID": "K1"}}
        }));
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_marker_mixed_with_children_rejected() {
        let result = Schema::from_value(&json!({
            "ssn": {"$encrypt": {"algorithm": "Random"}, "inner": {}}
        }));
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_root_leaf_rejected() {
        let result = Schema::from_value(&json!({"$encrypt": {"algorithm": "Random"}}));
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_nested_schema_on_scalar_rejected() {
        let schema = Schema::from_value(&json!({
            "filter": {"ssn": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}}}
        }))
        .unwrap();
        let result = match_fields(&schema, &json!({"filter": "oops"}), None);
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_deterministic_value_rules() {
        let schema = Schema::from_value(&json!({
            "v": {"$encrypt": {"algorithm": "Deterministic", "keyId": "K1"}}
        }))
        .unwrap();

        assert!(match_fields(&schema, &json!({"v": "text"}), None).is_ok());
        assert!(match_fields(&schema, &json!({"v": 42}), None).is_ok());
        for rejected in [json!(1.5), json!(true), json!(null), json!([1]), json!({"a": 1})] {
            let result = match_fields(&schema, &json!({ "v": rejected }), None);
            assert!(matches!(result, Err(Error::Schema(_))));
        }
    }

    #[test]
    fn test_random_value_rules() {
        let schema = Schema::from_value(&json!({
            "v": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}}
        }))
        .unwrap();

        for accepted in [json!(1.5), json!(true), json!([1, 2]), json!({"a": 1}), json!("s")] {
            assert!(match_fields(&schema, &json!({ "v": accepted }), None).is_ok());
        }
        assert!(match_fields(&schema, &json!({"v": null}), None).is_err());
    }

    #[test]
    fn test_already_encrypted_value_rejected() {
        let schema = Schema::from_value(&json!({
            "v": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}}
        }))
        .unwrap();
        let command = json!({"v": {"$binary": {"base64": "AQID", "subType": "06"}}});

        let err = match_fields(&schema, &command, None).unwrap_err();
        assert!(matches!(err, Error::Schema(msg) if msg.contains("already encrypted")));
    }

    #[test]
    fn test_schema_from_slice() {
        let schema =
            Schema::from_slice(br#"{"a": {"$encrypt": {"algorithm": "Random", "keyId": "K1"}}}"#)
                .unwrap();
        assert_eq!(match_fields(&schema, &serde_json::json!({"a": 1}), None).unwrap().len(), 1);
        assert!(matches!(Schema::from_slice(b"{"), Err(Error::Schema(_))));
    }

    #[test]
    fn test_unmatched_command_fields_untouched() {
        let command =
            json!({"find": "c", "filter": {"name": "a", "ssn": "b", "age": 30}, "limit": 1});
        let matched = match_fields(&scenario_schema(), &command, None).unwrap();
        assert_eq!(matched.len(), 2);
    }
}
