//! Layer store: content-addressed filesystem layers and their parent chains.

mod guard;
mod inflight;
mod record;
mod store;

pub(crate) use guard::LayerLease;
pub use record::{LayerId, LayerRecord};
pub use store::LayerStore;
