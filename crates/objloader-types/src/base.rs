use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::id::BaseId;

/// Name of the mandatory id field.
pub const ID_FIELD: &str = "id";
/// Name of the optional closure field.
pub const CLOSURE_FIELD: &str = "__closure";
const REFERENCE_FIELD: &str = "referencedId";

/// Declared transitive descendants of a Base, mapped to an integer weight.
///
/// The weight is a distance/priority hint from the producer and is never
/// treated as authoritative.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Closure(BTreeMap<BaseId, i64>);

impl Closure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: BaseId, weight: i64) {
        self.0.insert(id, weight);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &BaseId) -> bool {
        self.0.contains_key(id)
    }

    pub fn weight(&self, id: &BaseId) -> Option<i64> {
        self.0.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BaseId> {
        self.0.keys()
    }

    fn from_value(owner: &str, value: &Value) -> Result<Self, TypeError> {
        let invalid = |reason: String| TypeError::InvalidClosure {
            id: owner.to_string(),
            reason,
        };
        let map = value
            .as_object()
            .ok_or_else(|| invalid("expected an object".into()))?;
        let mut closure = Closure::new();
        for (child, weight) in map {
            let weight = weight
                .as_i64()
                .ok_or_else(|| invalid(format!("weight of {child} is not an integer")))?;
            let child = BaseId::parse(child).map_err(|e| invalid(e.to_string()))?;
            closure.insert(child, weight);
        }
        Ok(closure)
    }

    fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(id, w)| (id.to_string(), Value::from(*w)))
                .collect(),
        )
    }
}

impl FromIterator<(BaseId, i64)> for Closure {
    fn from_iter<I: IntoIterator<Item = (BaseId, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A pointer to another Base stored and fetched independently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "referencedId")]
    pub referenced_id: BaseId,
}

impl Reference {
    /// Recognize `{ "referencedId": "<id>", ... }`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.as_object()?.get(REFERENCE_FIELD)?.as_str()?;
        BaseId::parse(id).ok().map(|referenced_id| Self { referenced_id })
    }
}

/// A content-addressed JSON record.
///
/// Only the `id` and the shape of `__closure` are validated; all other
/// fields are kept verbatim in `fields` and written back on serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Base {
    pub id: BaseId,
    pub closure: Option<Closure>,
    pub fields: Map<String, Value>,
}

impl Base {
    /// A Base with no closure and no extra fields.
    pub fn new(id: impl Into<BaseId>) -> Self {
        Self {
            id: id.into(),
            closure: None,
            fields: Map::new(),
        }
    }

    pub fn with_closure(mut self, closure: Closure) -> Self {
        self.closure = Some(closure);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        let Value::Object(mut map) = value else {
            return Err(TypeError::NotAnObject);
        };
        let id = match map.remove(ID_FIELD) {
            Some(Value::String(s)) => BaseId::parse(&s)?,
            Some(other) => return Err(TypeError::InvalidId(format!("not a string: {other}"))),
            None => return Err(TypeError::MissingId),
        };
        let closure = match map.remove(CLOSURE_FIELD) {
            None | Some(Value::Null) => None,
            Some(v) => Some(Closure::from_value(id.as_str(), &v)?),
        };
        Ok(Self {
            id,
            closure,
            fields: map,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, TypeError> {
        let value: Value = serde_json::from_str(json).map_err(|e| TypeError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_json_slice(json: &[u8]) -> Result<Self, TypeError> {
        let value: Value =
            serde_json::from_slice(json).map_err(|e| TypeError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        map.insert(ID_FIELD.into(), Value::String(self.id.to_string()));
        if let Some(closure) = &self.closure {
            map.insert(CLOSURE_FIELD.into(), closure.to_value());
        }
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // A `Value` built from string keys always serializes.
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }

    /// Ids listed in `__closure`, empty when absent.
    pub fn children(&self) -> impl Iterator<Item = &BaseId> {
        self.closure.iter().flat_map(|c| c.ids())
    }

    pub fn has_children(&self) -> bool {
        self.closure.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Every `{ "referencedId": ... }` placeholder nested in the fields.
    pub fn references(&self) -> Vec<Reference> {
        let mut found = Vec::new();
        let mut stack: Vec<&Value> = self.fields.values().collect();
        while let Some(value) = stack.pop() {
            match value {
                Value::Object(map) => {
                    if let Some(r) = Reference::from_value(value) {
                        found.push(r);
                    }
                    stack.extend(map.values());
                }
                Value::Array(items) => stack.extend(items.iter()),
                _ => {}
            }
        }
        found
    }
}

impl TryFrom<Value> for Base {
    type Error = TypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Base> for Value {
    fn from(base: Base) -> Self {
        base.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_base() {
        let base = Base::from_value(json!({ "id": "abc" })).unwrap();
        assert_eq!(base.id.as_str(), "abc");
        assert!(base.closure.is_none());
        assert!(!base.has_children());
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = Base::from_value(json!({ "speckle_type": "Base" })).unwrap_err();
        assert_eq!(err, TypeError::MissingId);
    }

    #[test]
    fn non_string_id_is_rejected() {
        assert!(matches!(
            Base::from_value(json!({ "id": 42 })),
            Err(TypeError::InvalidId(_))
        ));
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(Base::from_value(json!([1, 2])).unwrap_err(), TypeError::NotAnObject);
    }

    #[test]
    fn closure_is_parsed() {
        let base = Base::from_value(json!({
            "id": "parent",
            "__closure": { "a": 1, "b": 2 }
        }))
        .unwrap();
        let closure = base.closure.as_ref().unwrap();
        assert_eq!(closure.len(), 2);
        assert_eq!(closure.weight(&BaseId::new("b")), Some(2));
        let kids: Vec<_> = base.children().map(|c| c.as_str()).collect();
        assert_eq!(kids, vec!["a", "b"]);
    }

    #[test]
    fn malformed_closure_is_rejected() {
        let err = Base::from_value(json!({ "id": "p", "__closure": ["a"] })).unwrap_err();
        assert!(matches!(err, TypeError::InvalidClosure { .. }));
        let err = Base::from_value(json!({ "id": "p", "__closure": { "a": "x" } })).unwrap_err();
        assert!(matches!(err, TypeError::InvalidClosure { .. }));
    }

    #[test]
    fn null_closure_is_absent() {
        let base = Base::from_value(json!({ "id": "p", "__closure": null })).unwrap();
        assert!(base.closure.is_none());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let input = json!({
            "id": "obj",
            "speckle_type": "Objects.Geometry.Mesh",
            "vertices": [0.0, 1.5, 2.0],
            "nested": { "deep": { "value": true } }
        });
        let base = Base::from_value(input.clone()).unwrap();
        assert_eq!(base.to_value(), input);
    }

    #[test]
    fn serde_uses_flat_layout() {
        let base = Base::new("x")
            .with_closure([(BaseId::new("y"), 1)].into_iter().collect())
            .with_field("name", json!("wall"));
        let text = serde_json::to_string(&base).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], "x");
        assert_eq!(value["__closure"]["y"], 1);
        assert_eq!(value["name"], "wall");
        let back: Base = serde_json::from_str(&text).unwrap();
        assert_eq!(back, base);
    }

    #[test]
    fn references_are_found_in_nested_fields() {
        let base = Base::from_value(json!({
            "id": "root",
            "elements": [
                { "referencedId": "c1", "speckle_type": "reference" },
                { "inner": { "referencedId": "c2" } }
            ],
            "displayValue": { "referencedId": "c3" }
        }))
        .unwrap();
        let mut ids: Vec<_> = base
            .references()
            .into_iter()
            .map(|r| r.referenced_id.into_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }
}
