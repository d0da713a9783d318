//! CLI arguments and their validation into a [`ServerConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use zipstream::config::DEFAULT_CHUNK_SIZE;
use zipstream::ServerConfig;

/// Command-line arguments for the archive server.
///
/// Every flag can also be supplied through the environment (and therefore a
/// `.env` file), which is how deployments are expected to configure it.
#[derive(Parser, Debug)]
#[command(name = "zipstream-server", version, about)]
pub struct CliArgs {
    /// Address to listen on.
    #[arg(long, env = "ZIPSTREAM_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Directory whose subdirectories are downloadable as archives.
    #[arg(short, long, env = "ZIPSTREAM_PATH", default_value = "test_photos")]
    pub path: PathBuf,

    /// Pause before each response chunk, in milliseconds (0 = disabled).
    #[arg(short = 's', long, env = "ZIPSTREAM_THROTTLE_MS", default_value_t = 0)]
    pub throttle_ms: u64,

    /// Read buffer size for compressor output, in bytes.
    #[arg(long, env = "ZIPSTREAM_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Compressor executable, invoked as `<zip-bin> -r - <identifier>`.
    #[arg(long, env = "ZIPSTREAM_ZIP_BIN", default_value = "zip")]
    pub zip_bin: PathBuf,

    /// HTML file served at the root route.
    #[arg(long, env = "ZIPSTREAM_INDEX", default_value = "index.html")]
    pub index: PathBuf,

    /// Kill archive streams running longer than this many seconds
    /// (0 = unlimited).
    #[arg(long, env = "ZIPSTREAM_STREAM_TIMEOUT", default_value_t = 0)]
    pub stream_timeout: u64,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let base_dir = args
            .path
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("base directory {:?} is not usable: {e}", args.path))?;
        anyhow::ensure!(
            base_dir.is_dir(),
            "base directory {base_dir:?} is not a directory"
        );
        anyhow::ensure!(args.chunk_size > 0, "chunk size must be greater than 0");

        Ok(Self {
            listen_addr: args.addr,
            base_dir,
            chunk_size: args.chunk_size,
            throttle: (args.throttle_ms > 0).then(|| Duration::from_millis(args.throttle_ms)),
            zip_bin: args.zip_bin,
            index_path: args.index,
            stream_timeout: (args.stream_timeout > 0)
                .then(|| Duration::from_secs(args.stream_timeout)),
        })
    }
}
