//! Server configuration shared by the pipeline and the HTTP layer.
//!
//! Everything the pipeline needs to know arrives through [`ServerConfig`];
//! there are no module-level globals. The server binary builds one from its
//! CLI arguments and hands it to every request via shared state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default read-buffer size for compressor output, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 512_000;

/// Validated, immutable configuration for the archive service.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub listen_addr: SocketAddr,
    /// Directory whose immediate subdirectories are served as archives.
    pub base_dir: PathBuf,
    /// Upper bound on a single read from the compressor's stdout.
    pub chunk_size: usize,
    /// Optional pause inserted before each chunk is forwarded. A testing
    /// knob for simulating slow transfers, not a correctness requirement.
    pub throttle: Option<Duration>,
    /// Compressor executable, invoked as `<zip_bin> -r - <identifier>`.
    pub zip_bin: PathBuf,
    /// HTML file served at the root route.
    pub index_path: PathBuf,
    /// Optional cap on how long one archive stream may run before it is
    /// aborted and the compressor killed. `None` means unlimited.
    pub stream_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Configuration with library defaults for the given base directory.
    ///
    /// The server binary overrides these from CLI arguments; tests use this
    /// constructor directly.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            base_dir: base_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle: None,
            zip_bin: PathBuf::from("zip"),
            index_path: PathBuf::from("index.html"),
            stream_timeout: None,
        }
    }
}
