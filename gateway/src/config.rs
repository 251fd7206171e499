use socket_registry::RegistryConfig;

/// WebSocket port the gateway listens on when PORT is unset.
pub const DEFAULT_PORT: u16 = 8181;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub port: u16,
    pub registry: RegistryConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup, reporting every problem at once.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut errors = Vec::new();

        let port = match var("PORT") {
            Some(value) => value.trim().parse::<u16>().unwrap_or_else(|_| {
                errors.push(format!("PORT must be a port number, got '{}'", value));
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };

        let registry = RegistryConfig::from_lookup(&var).unwrap_or_else(|e| {
            errors.push(e.to_string());
            RegistryConfig::default()
        });

        if !errors.is_empty() {
            return Err(format!(
                "Invalid configuration:\n  - {}\n\nSee .env.example for configuration guide.",
                errors.join("\n  - ")
            ));
        }

        Ok(Self { port, registry })
    }
}

/// Tokio worker threads: TOKIO_WORKER_THREADS, else 2x CPUs (min 8).
pub fn worker_threads() -> usize {
    std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| num_cpus::get().max(4) * 2)
}
