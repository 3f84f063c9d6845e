pub mod frame;
pub mod log;
pub mod recovery;

/// Log sequence number. Strictly increasing across frames; 0 means "before
/// any commit" and is never assigned to a frame.
pub type Lsn = u64;

/// Reader handle id, allocated by the reader registry.
pub type ReaderId = u64;
