pub mod checksum;
pub mod chunker;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod store;
pub mod util;

/// Fragments are 400 MiB unless the caller asks otherwise.  Every fragment except the last one of
/// a file has exactly this many bytes; the last one holds whatever remains (and is never empty).
pub const DEFAULT_FRAGMENT_SIZE: usize = 400 * 1024 * 1024;
