use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "vcam")]
#[command(about = "📷 Virtual security camera: MJPEG over HTTPS and HTTP", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Port for the HTTPS listener
    #[arg(long, env = "VCAM_HTTPS_PORT", default_value_t = 8080)]
    pub https_port: u16,

    /// Port for the HTTP listener
    #[arg(long, env = "VCAM_HTTP_PORT", default_value_t = 8081)]
    pub http_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "VCAM_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Run only the HTTPS listener
    #[arg(long)]
    pub https_only: bool,

    /// Run only the HTTP listener
    #[arg(long)]
    pub http_only: bool,

    /// Camera index (0 = default webcam), device path, or video file path
    #[arg(long, env = "VCAM_CAMERA", default_value = "0")]
    pub camera: String,

    /// Generate synthetic frames instead of using a camera
    #[arg(long)]
    pub simulation: bool,

    /// Frame width in pixels
    #[arg(long, default_value_t = 640)]
    pub width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 480)]
    pub height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 85)]
    pub quality: u8,

    /// TLS certificate (PEM)
    #[arg(long, env = "VCAM_CERT", default_value = "certs/virtual_camera.crt")]
    pub cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, env = "VCAM_KEY", default_value = "certs/virtual_camera.key")]
    pub key: PathBuf,

    /// Do not generate a self-signed certificate when the files are missing
    #[arg(long)]
    pub no_generate_cert: bool,

    /// Authentication required for the viewer and stream
    #[arg(long, value_enum, env = "VCAM_AUTH", default_value_t = AuthArg::None)]
    pub auth: AuthArg,

    #[arg(long, env = "VCAM_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "VCAM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Consecutive capture failures tolerated before switching to synthetic frames
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Pause between capture retries
    #[arg(long, default_value_t = 50)]
    pub retry_backoff_ms: u64,

    /// Fail instead of falling back to synthetic frames
    #[arg(long)]
    pub no_fallback: bool,

    /// Longest wait for the camera to deliver a frame
    #[arg(long, default_value_t = 2000)]
    pub device_timeout_ms: u64,

    /// Seconds streaming clients get to finish on shutdown
    #[arg(long, default_value_t = 5)]
    pub drain_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AuthArg {
    None,
    Basic,
    Digest,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
