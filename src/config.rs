use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

const MAX_RETRIES: u32 = 10;
const MAX_BACKOFF_MS: u64 = 60_000;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Per-run settings. Built once in `main`, then only borrowed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub concurrency: usize,
    pub render_fallback: bool,
    pub max_listing_pages: usize,
    pub max_pages: Option<usize>,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub download_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            concurrency: 8,
            render_fallback: true,
            max_listing_pages: 100,
            max_pages: None,
            max_retries: 3,
            backoff_ms: 2000,
            download_delay_ms: 250,
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Values given on the command line; `None` leaves the env/default value alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub concurrency: Option<usize>,
    pub no_render: bool,
    pub output_dir: Option<PathBuf>,
    pub max_listing_pages: Option<usize>,
    pub max_pages: Option<usize>,
}

impl RunConfig {
    /// Defaults, then `MODELHUB_*` environment variables, then CLI flags.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("MODELHUB").try_parsing(true))
            .build()
            .context("Failed to read MODELHUB_* settings")?;
        let base: RunConfig = settings
            .try_deserialize()
            .context("Invalid MODELHUB_* settings")?;
        let config = base.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(mut self, overrides: &Overrides) -> Self {
        if let Some(n) = overrides.concurrency {
            self.concurrency = n;
        }
        if overrides.no_render {
            self.render_fallback = false;
        }
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(n) = overrides.max_listing_pages {
            self.max_listing_pages = n;
        }
        if overrides.max_pages.is_some() {
            self.max_pages = overrides.max_pages;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=256).contains(&self.concurrency) {
            bail!("concurrency must be within 1..=256, got {}", self.concurrency);
        }
        if self.max_listing_pages == 0 {
            bail!("max_listing_pages must be at least 1");
        }
        if self.max_pages == Some(0) {
            bail!("max_pages must be at least 1 when set");
        }
        if self.max_retries > MAX_RETRIES {
            bail!("max_retries must be at most {}, got {}", MAX_RETRIES, self.max_retries);
        }
        if self.backoff_ms > MAX_BACKOFF_MS {
            bail!("backoff_ms must be at most {}, got {}", MAX_BACKOFF_MS, self.backoff_ms);
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.user_agent.trim().is_empty() {
            bail!("user_agent must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win() {
        let config = RunConfig::default().apply(&Overrides {
            concurrency: Some(32),
            no_render: true,
            output_dir: Some(PathBuf::from("/tmp/out")),
            ..Default::default()
        });
        assert_eq!(config.concurrency, 32);
        assert!(!config.render_fallback);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.max_listing_pages, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn retry_settings_are_bounded() {
        let config = RunConfig {
            max_retries: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RunConfig {
            backoff_ms: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RunConfig {
            max_retries: MAX_RETRIES,
            backoff_ms: MAX_BACKOFF_MS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn concurrency_is_bounded() {
        for bad in [0, 257] {
            let config = RunConfig {
                concurrency: bad,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }
}
