use serde::Deserialize;

/// Default cap on a fully buffered request body, in bytes.
pub const DEFAULT_MAX_BUFFERED_BODY_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Maximum number of body bytes buffered for a single request before a
    /// 413 fault is synthesized.
    pub max_buffered_body_size: usize,
    /// Run request middleware independently instead of pairing each with its
    /// response-stage counterpart.
    pub independent_middleware: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_buffered_body_size: DEFAULT_MAX_BUFFERED_BODY_SIZE,
            independent_middleware: false,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Config::default();

        let listen_addr =
            std::env::var("SLIPSTREAM_LISTEN")
                .unwrap_or(defaults.listen_addr);

        let max_buffered_body_size =
            std::env::var("SLIPSTREAM_MAX_BODY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_buffered_body_size);

        let independent_middleware =
            std::env::var("SLIPSTREAM_INDEPENDENT_MIDDLEWARE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.independent_middleware);

        Self {
            listen_addr,
            max_buffered_body_size,
            independent_middleware,
        }
    }

    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        let cfg = serde_yaml::from_str(s)?;
        Ok(cfg)
    }
}
