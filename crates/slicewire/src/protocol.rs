//! Wire-level constants for the slicewire encoding.

/// Major version of the encoding this implementation speaks. A received
/// encapsulation with a different major version is rejected.
pub const ENCODING_MAJOR: u8 = 1;

/// Highest minor encoding version this implementation understands. Lower
/// minors are tolerated (forward compatibility); higher minors are rejected.
pub const ENCODING_MINOR: u8 = 0;

/// Encapsulation header: 4-byte signed length + major + minor version bytes.
pub const ENCAPS_HEADER_SIZE: usize = 6;

/// Slice header: a 4-byte signed length that counts itself.
pub const SLICE_HEADER_SIZE: usize = 4;

/// Largest size value encoded in a single byte. Anything larger goes on the
/// wire as [`SIZE_MARKER`] followed by a 4-byte signed integer.
pub const MAX_COMPACT_SIZE: i32 = 254;

/// Marker byte introducing the 5-byte size encoding.
pub const SIZE_MARKER: u8 = 255;

/// Default maximum message size: 1 MiB.
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;
