use crate::protocol::DEFAULT_MESSAGE_SIZE_MAX;

/// Owning runtime handle consulted by streams for configuration.
///
/// A stream borrows its `Instance` for the duration of one message and only
/// ever reads from it; resource policy lives here, not in the stream.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Hard cap on marshalled message size in bytes. Default: 1 MiB.
    pub message_size_max: usize,
}

impl Instance {
    /// Create an instance with an explicit maximum message size.
    pub fn new(message_size_max: usize) -> Self {
        Self { message_size_max }
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
        }
    }
}
