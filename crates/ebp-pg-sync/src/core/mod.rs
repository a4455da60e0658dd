//! Engine-neutral building blocks shared by every component.

pub mod identifier;
pub mod traits;
pub mod value;

pub use traits::{SourceDatabase, TargetDatabase};
pub use value::{Row, SqlValue, ValueKind};
