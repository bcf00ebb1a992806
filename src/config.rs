//! Immutable runtime configuration built once from the command line.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::cli::{AuthArg, Cli};

/// Largest accepted width or height (8K)
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Camera index or device path
    Device(String),
    File(PathBuf),
    Synthetic,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(d) => write!(f, "camera {}", d),
            Self::File(p) => write!(f, "file {}", p.display()),
            Self::Synthetic => write!(f, "synthetic generator"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Longest wait for the device to hand over a frame
    pub read_timeout: Duration,
}

impl SourceConfig {
    pub fn synthetic(width: u32, height: u32) -> Self {
        Self {
            kind: SourceKind::Synthetic,
            width,
            height,
            fps: 30,
            quality: 85,
            read_timeout: Duration::from_secs(2),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }
}

/// Retry-then-degrade policy for the capture loop
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    /// Consecutive failures tolerated before switching to synthetic frames
    pub max_retries: u32,
    /// Pause between retries
    pub backoff: Duration,
    /// Fall back to synthetic frames instead of failing
    pub fallback: bool,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(50),
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Secure,
    Plain,
}

impl Transport {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Secure => "https",
            Self::Plain => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Write a self-signed pair when either file is missing
    pub generate: bool,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub transport: Transport,
    pub addr: SocketAddr,
    /// Present for secure listeners only
    pub tls: Option<TlsFiles>,
}

impl ListenerConfig {
    pub fn plain(addr: SocketAddr) -> Self {
        Self {
            transport: Transport::Plain,
            addr,
            tls: None,
        }
    }

    pub fn secure(addr: SocketAddr, tls: TlsFiles) -> Self {
        Self {
            transport: Transport::Secure,
            addr,
            tls: Some(tls),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Basic,
    Digest,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub source: SourceConfig,
    pub capture: CapturePolicy,
    pub listeners: Vec<ListenerConfig>,
    pub auth: AuthMode,
    pub credentials: Option<Credentials>,
    /// How long streaming clients get to finish after shutdown begins
    pub drain_deadline: Duration,
    /// Idle wait between liveness checks on a streaming connection
    pub stream_poll: Duration,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.https_only && cli.http_only {
            bail!("--https-only and --http-only cannot be combined");
        }
        if cli.width == 0 || cli.height == 0 {
            bail!("resolution must be non-zero, got {}x{}", cli.width, cli.height);
        }
        if cli.width > MAX_DIMENSION || cli.height > MAX_DIMENSION {
            bail!(
                "resolution {}x{} exceeds the {}px limit",
                cli.width,
                cli.height,
                MAX_DIMENSION
            );
        }
        if cli.fps == 0 {
            bail!("--fps must be at least 1");
        }
        if !(1..=100).contains(&cli.quality) {
            bail!("--quality must be between 1 and 100, got {}", cli.quality);
        }

        let kind = if cli.simulation {
            SourceKind::Synthetic
        } else if !cli.camera.is_empty() && cli.camera.chars().all(|c| c.is_ascii_digit()) {
            SourceKind::Device(cli.camera.clone())
        } else if cli.camera.starts_with("/dev/") {
            SourceKind::Device(cli.camera.clone())
        } else {
            SourceKind::File(PathBuf::from(&cli.camera))
        };

        let source = SourceConfig {
            kind,
            width: cli.width,
            height: cli.height,
            fps: cli.fps,
            quality: cli.quality,
            read_timeout: Duration::from_millis(cli.device_timeout_ms),
        };

        let bind: IpAddr = cli.bind;
        let mut listeners = Vec::new();
        if !cli.http_only {
            listeners.push(ListenerConfig::secure(
                SocketAddr::new(bind, cli.https_port),
                TlsFiles {
                    cert: cli.cert.clone(),
                    key: cli.key.clone(),
                    generate: !cli.no_generate_cert,
                },
            ));
        }
        if !cli.https_only {
            listeners.push(ListenerConfig::plain(SocketAddr::new(bind, cli.http_port)));
        }
        if listeners.len() == 2 && cli.https_port == cli.http_port {
            bail!("HTTPS and HTTP listeners cannot share port {}", cli.http_port);
        }

        let auth = match cli.auth {
            AuthArg::None => AuthMode::None,
            AuthArg::Basic => AuthMode::Basic,
            AuthArg::Digest => AuthMode::Digest,
        };
        let credentials = match (&cli.username, &cli.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            _ => bail!("--username and --password must be given together"),
        };
        if auth != AuthMode::None && credentials.is_none() {
            bail!("--auth {:?} requires --username and --password", cli.auth);
        }

        Ok(Self {
            source,
            capture: CapturePolicy {
                max_retries: cli.retries,
                backoff: Duration::from_millis(cli.retry_backoff_ms),
                fallback: !cli.no_fallback,
            },
            listeners,
            auth,
            credentials,
            drain_deadline: Duration::from_secs(cli.drain_secs),
            stream_poll: Duration::from_secs(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["vcam"];
        argv.extend_from_slice(args);
        ServerConfig::from_cli(&Cli::try_parse_from(argv)?)
    }

    #[test]
    fn test_defaults_start_both_listeners() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].transport, Transport::Secure);
        assert_eq!(config.listeners[0].addr.port(), 8080);
        assert_eq!(config.listeners[1].transport, Transport::Plain);
        assert_eq!(config.listeners[1].addr.port(), 8081);
        assert_eq!(config.source.kind, SourceKind::Device("0".into()));
        assert_eq!(config.source.quality, 85);
        assert_eq!(config.auth, AuthMode::None);
    }

    #[test]
    fn test_camera_argument_kinds() {
        let config = parse(&["--camera", "clip.mp4"]).unwrap();
        assert_eq!(config.source.kind, SourceKind::File("clip.mp4".into()));

        let config = parse(&["--camera", "/dev/video2"]).unwrap();
        assert_eq!(config.source.kind, SourceKind::Device("/dev/video2".into()));

        let config = parse(&["--camera", "3", "--simulation"]).unwrap();
        assert_eq!(config.source.kind, SourceKind::Synthetic);
    }

    #[test]
    fn test_single_transport() {
        let config = parse(&["--http-only"]).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].transport, Transport::Plain);

        let config = parse(&["--https-only"]).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert!(config.listeners[0].tls.is_some());
    }

    #[test]
    fn test_rejects_invalid_combinations() {
        assert!(parse(&["--http-only", "--https-only"]).is_err());
        assert!(parse(&["--auth", "basic"]).is_err());
        assert!(parse(&["--username", "u"]).is_err());
        assert!(parse(&["--fps", "0"]).is_err());
        assert!(parse(&["--quality", "0"]).is_err());
        assert!(parse(&["--width", "100000"]).is_err());
        assert!(parse(&["--height", "4294967295"]).is_err());
        assert!(parse(&["--width", "8192", "--height", "8192"]).is_ok());
        assert!(parse(&["--https-port", "9000", "--http-port", "9000"]).is_err());
    }

    #[test]
    fn test_auth_with_credentials() {
        let config = parse(&["--auth", "digest", "--username", "username", "--password", "password"]).unwrap();
        assert_eq!(config.auth, AuthMode::Digest);
        assert_eq!(config.credentials.unwrap().username, "username");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "admin".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_frame_interval() {
        let mut source = SourceConfig::synthetic(10, 10);
        source.fps = 10;
        assert_eq!(source.frame_interval(), Duration::from_millis(100));
    }
}
