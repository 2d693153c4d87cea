// Entity Models
// "Identity persists, values change"
//
// - Stable identity (id) that NEVER changes
// - Mutable metrics validated on every update, superseded versions kept
// - Registry for ordered iteration and lookups

pub mod entity;
pub mod registry;

pub use entity::{Entity, EntityCategory, EntityUpdate};
pub use registry::{load_entities, load_entities_csv, load_entities_json, EntityRegistry};
