use serde::{Deserialize, Serialize};

use crate::base::Base;
use crate::error::TypeError;
use crate::id::BaseId;

/// A resolved Base paired with its id.
///
/// `base_id` always equals `base.id`; the constructors enforce it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub base_id: BaseId,
    pub base: Base,
}

impl Item {
    pub fn new(base: Base) -> Self {
        Self {
            base_id: base.id.clone(),
            base,
        }
    }

    /// Pair an externally supplied id with a Base, checking they agree.
    pub fn from_parts(base_id: BaseId, base: Base) -> Result<Self, TypeError> {
        if base_id != base.id {
            return Err(TypeError::IdMismatch {
                expected: base_id.into_string(),
                actual: base.id.into_string(),
            });
        }
        Ok(Self { base_id, base })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, TypeError> {
        serde_json::to_vec(self).map_err(|e| TypeError::Json(e.to_string()))
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let item: Item =
            serde_json::from_slice(bytes).map_err(|e| TypeError::Json(e.to_string()))?;
        Self::from_parts(item.base_id, item.base)
    }

    /// Approximate serialized size of the Base in bytes.
    pub fn size_hint(&self) -> usize {
        self.base.to_json_bytes().len()
    }
}

/// Outcome of looking up a single requested id.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The object was found.
    Found(Item),
    /// The remote service completed the request without the object.
    Missing(BaseId),
    /// The request carrying this id failed (transport, status, or an
    /// unusable response).
    Failed { id: BaseId, reason: String },
}

impl Resolution {
    pub fn id(&self) -> &BaseId {
        match self {
            Self::Found(item) => &item.base_id,
            Self::Missing(id) => id,
            Self::Failed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_copies_base_id() {
        let item = Item::new(Base::new("abc"));
        assert_eq!(item.base_id, item.base.id);
    }

    #[test]
    fn from_parts_rejects_mismatch() {
        let err = Item::from_parts(BaseId::new("a"), Base::new("b")).unwrap_err();
        assert!(matches!(err, TypeError::IdMismatch { .. }));
    }

    #[test]
    fn json_layout_uses_base_id_key() {
        let item = Item::new(Base::new("abc").with_field("n", json!(1)));
        let value: serde_json::Value =
            serde_json::from_slice(&item.to_json_bytes().unwrap()).unwrap();
        assert_eq!(value["baseId"], "abc");
        assert_eq!(value["base"]["id"], "abc");
        assert_eq!(value["base"]["n"], 1);
    }

    #[test]
    fn from_json_slice_validates_ids() {
        let bytes = br#"{"baseId":"a","base":{"id":"b"}}"#;
        assert!(Item::from_json_slice(bytes).is_err());
        let bytes = br#"{"baseId":"a","base":{"id":"a","x":[1,2]}}"#;
        let item = Item::from_json_slice(bytes).unwrap();
        assert_eq!(item.base.fields["x"], json!([1, 2]));
    }

    #[test]
    fn resolution_id() {
        let found = Resolution::Found(Item::new(Base::new("f")));
        assert_eq!(found.id().as_str(), "f");
        assert_eq!(Resolution::Missing(BaseId::new("m")).id().as_str(), "m");
        let failed = Resolution::Failed { id: BaseId::new("x"), reason: "boom".into() };
        assert_eq!(failed.id().as_str(), "x");
    }

    #[test]
    fn size_hint_matches_serialized_base() {
        let item = Item::new(Base::new("abc"));
        assert_eq!(item.size_hint(), br#"{"id":"abc"}"#.len());
    }
}
