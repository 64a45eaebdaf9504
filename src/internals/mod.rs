//! Internal implementation utilities.
//!
//! These modules support the public pipeline components and are not part of
//! the crate's API surface.

pub(crate) mod dates;
pub(crate) mod fs;
pub(crate) mod tokens;
