use std::fmt;

use crate::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Backing store for the membership relations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared Redis; required for fanout across more than one instance.
    #[default]
    Redis,

    /// In-process store. Single-instance deployments and local development.
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!(
                "STORE_BACKEND must be 'redis' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl RegistryConfig {
    /// Read STORE_BACKEND and REDIS_URL through `var`, e.g.
    /// `|name| std::env::var(name).ok()`.
    ///
    /// Blank or missing values fall back to the defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let backend = match var("STORE_BACKEND") {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => StoreBackend::default(),
        };

        let redis_url = match var("REDIS_URL") {
            Some(url) if !url.trim().is_empty() => url,
            _ => {
                if backend == StoreBackend::Redis {
                    tracing::warn!(
                        "REDIS_URL not set, using {} (set STORE_BACKEND=memory for single instance)",
                        DEFAULT_REDIS_URL
                    );
                }
                DEFAULT_REDIS_URL.to_string()
            }
        };

        Ok(Self { backend, redis_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_default() {
        assert_eq!(StoreBackend::default(), StoreBackend::Redis);
    }

    #[test]
    fn test_store_backend_display() {
        assert_eq!(StoreBackend::Redis.to_string(), "redis");
        assert_eq!(StoreBackend::Memory.to_string(), "memory");
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!(" Redis ".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert!(matches!(
            "postgres".parse::<StoreBackend>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = RegistryConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RegistryConfig::default());
    }

    #[test]
    fn test_from_lookup_reads_backend_and_url() {
        let config = RegistryConfig::from_lookup(|name| match name {
            "STORE_BACKEND" => Some("memory".into()),
            "REDIS_URL" => Some("redis://cache:6380".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.redis_url, "redis://cache:6380");
    }

    #[test]
    fn test_from_lookup_rejects_unknown_backend() {
        let result = RegistryConfig::from_lookup(|name| {
            (name == "STORE_BACKEND").then(|| "postgres".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
