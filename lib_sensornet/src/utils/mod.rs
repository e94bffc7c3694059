//! # Utilities Module
//!
//! General-purpose helpers shared by the library and the binaries. Kept free of
//! any engine types so the sensor simulator can use them without pulling in the
//! buffers.

/// Timestamp formats used on the wire and on the dashboard.
pub mod timefmt;

pub use timefmt::{clock_hms, day_of_year_stamp, parse_day_of_year_stamp, rfc3339_millis};
