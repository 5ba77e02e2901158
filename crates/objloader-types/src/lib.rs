//! Foundation types for the object-graph loader.
//!
//! Every crate in the workspace depends on `objloader-types`. The model is
//! deliberately loose: a [`Base`] is any JSON object with a string `id`
//! and an optional `__closure`, everything else is carried through as-is.
//!
//! # Key Types
//!
//! - [`BaseId`]: content hash identifying a Base (identical id ⇒ identical content)
//! - [`Base`]: a JSON record with a mandatory id and open field map
//! - [`Closure`]: declared map of transitive descendant ids → weight
//! - [`Reference`]: `{ "referencedId": ... }` placeholder inside a Base
//! - [`Item`]: `{ baseId, base }`, the unit moved through queues and the cache
//! - [`Resolution`]: the outcome of looking up one requested id

pub mod base;
pub mod error;
pub mod id;
pub mod item;

pub use base::{Base, Closure, Reference, CLOSURE_FIELD, ID_FIELD};
pub use error::TypeError;
pub use id::BaseId;
pub use item::{Item, Resolution};
