use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use mitra_gateway::Heartbeat;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub public_url: String,
    pub heartbeat: Heartbeat,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = get("MITRA_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("MITRA_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let host = get("MITRA_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("MITRA_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("MITRA_PORT must be a port number")?;
        let db_path = get("MITRA_DB_PATH").unwrap_or_else(|| "mitra.db".into()).into();
        let upload_dir = get("MITRA_UPLOAD_DIR")
            .unwrap_or_else(|| "./uploads".into())
            .into();
        let public_url = get("MITRA_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();

        let mut heartbeat = Heartbeat::default();
        if let Some(secs) = get("MITRA_HEARTBEAT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("MITRA_HEARTBEAT_SECS must be a whole number of seconds")?;
            if secs == 0 {
                bail!("MITRA_HEARTBEAT_SECS must be at least 1");
            }
            heartbeat.interval = Duration::from_secs(secs);
        }

        Ok(Self {
            jwt_secret,
            host,
            port,
            db_path,
            upload_dir,
            public_url,
            heartbeat,
        })
    }
}
