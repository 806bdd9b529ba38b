//! Versioned binary marshalling for RPC messages.
//!
//! slicewire implements the byte-level wire format that carries requests,
//! replies, and exceptions between peers: a growable byte buffer with a read
//! cursor, nested length-prefixed encapsulations, polymorphic slice framing,
//! and a sequence-size guard that rejects adversarial element counts before
//! any allocation happens.
//!
//! Wire format (all integers little-endian, regardless of host):
//! - Encapsulation: 4-byte signed length (header inclusive) + major + minor
//!   version bytes
//! - Size/count: 1 byte for values 0..=254, else `0xFF` + 4-byte signed int
//! - String: size-encoded length + raw UTF-8 bytes
//! - Slice: 4-byte signed length, inclusive of itself
//! - Exception: type-id string + one slice per inheritance level
//!
//! A [`Stream`] is bound to an [`Instance`] (the resource policy, chiefly
//! the maximum message size), lives for one message, and is never shared
//! across threads while in use.

pub mod buffer;
pub mod error;
pub mod exception;
pub mod instance;
pub mod protocol;
pub mod proxy;
pub mod stream;

pub use buffer::Buffer;
pub use error::{MarshalError, Result};
pub use exception::{ExceptionFactory, ExceptionRegistry, UserException};
pub use instance::Instance;
pub use protocol::{DEFAULT_MESSAGE_SIZE_MAX, ENCODING_MAJOR, ENCODING_MINOR};
pub use proxy::{Identity, ProxyRef};
pub use stream::Stream;
