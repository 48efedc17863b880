// Entity state persistence and structural change detection

mod entity;
mod filter;
mod store;

pub use entity::{Attributes, ChangeRecord, EntityState, RawObservation};
pub use filter::AttributeFilter;
pub use store::{Clock, StateStore};
