//! A two-tier time wheel: a small sorted front-end for the closest
//! deadlines, an adaptive bucket array for the near future, and a lazily
//! sorted overflow list for everything further out.

mod wheel;

pub use wheel::{EntryId, TimeWheel};

/// A monotonic tick count. Strands pick their own epoch and resolution;
/// the wheel only ever compares ticks to each other.
pub type Ticks = u64;
