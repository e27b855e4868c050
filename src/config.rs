use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;

use crate::backend::{validate_backends, Backend, ConfigError};

pub const ENV_PREFIX: &str = "GATEWAY_";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub path_prefix: String,
    pub metrics_addr: Option<SocketAddr>,
    pub max_request_bytes: usize,
    pub shutdown_grace: Duration,
    pub rate_limit_max_requests: u64,
    pub rate_limit_window: Duration,
    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub backends: Vec<Backend>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            path_prefix: "/openai/v1".to_string(),
            metrics_addr: Some(SocketAddr::from(([0, 0, 0, 0], 9090))),
            max_request_bytes: 25 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(10),
            rate_limit_max_requests: 0,
            rate_limit_window: Duration::from_secs(60),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
            backends: Vec::new(),
        }
    }
}

fn invalid(name: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidSetting {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn name(suffix: &str) -> String {
        format!("{ENV_PREFIX}{suffix}")
    }

    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, suffix: &str) -> Option<String> {
        let v = self.raw(&Self::name(suffix))?;
        let v = v.trim();
        (!v.is_empty()).then(|| v.to_string())
    }

    fn parse<T>(&self, suffix: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.string(suffix) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| invalid(&Self::name(suffix), &raw, e))
    }

    fn bool(&self, suffix: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.string(suffix) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(
                &Self::name(suffix),
                &raw,
                "expected true/false",
            )),
        }
    }
}

fn parse_trusted_proxy_cidrs(raw: &str) -> Result<Vec<IpNet>, ConfigError> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        for token in part.split_whitespace() {
            let net = token.parse::<IpNet>().map_err(|e| {
                invalid(&format!("{ENV_PREFIX}TRUSTED_PROXY_CIDRS"), token, e)
            })?;
            out.push(net);
        }
    }
    Ok(out)
}

pub fn parse_allowed_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut cfg = Self::default();

        if let Some(host) = env.string("HOST") {
            cfg.host = host;
        }
        if let Some(port) = env.parse::<u16>("PORT")? {
            cfg.port = port;
        }
        if let Some(level) = env.string("LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Some(prefix) = env.string("PATH_PREFIX") {
            cfg.path_prefix = prefix;
        }
        cfg.path_prefix = cfg.path_prefix.trim_end_matches('/').to_string();

        // Set but empty disables the metrics listener.
        match env.raw(&Env::<F>::name("METRICS_ADDR")) {
            Some(raw) if raw.trim().is_empty() => cfg.metrics_addr = None,
            Some(_) => cfg.metrics_addr = env.parse::<SocketAddr>("METRICS_ADDR")?,
            None => {}
        }

        if let Some(value) = env.parse::<usize>("MAX_REQUEST_BYTES")? {
            cfg.max_request_bytes = value;
        }
        if let Some(secs) = env.parse::<u64>("SHUTDOWN_GRACE_SECS")? {
            cfg.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(value) = env.parse::<u64>("RATE_LIMIT_MAX_REQUESTS")? {
            cfg.rate_limit_max_requests = value;
        }
        if let Some(secs) = env.parse::<u64>("RATE_LIMIT_WINDOW_SECS")? {
            cfg.rate_limit_window = Duration::from_secs(secs);
        }

        if let Some(trust) = env.bool("TRUST_PROXY_HEADERS")? {
            cfg.trust_proxy_headers = trust;
        }
        if let Some(raw) = env.string("TRUSTED_PROXY_CIDRS") {
            cfg.trusted_proxy_cidrs = parse_trusted_proxy_cidrs(&raw)?;
        }

        cfg.backends = backends_from_env(&env);

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingSetting("GATEWAY_HOST"));
        }
        if self.port == 0 {
            return Err(invalid("GATEWAY_PORT", "0", "port must be non-zero"));
        }
        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            return Err(invalid(
                "GATEWAY_PATH_PREFIX",
                &self.path_prefix,
                "must start with '/'",
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(invalid(
                "GATEWAY_MAX_REQUEST_BYTES",
                "0",
                "must be greater than zero",
            ));
        }
        validate_backends(&self.backends)
    }
}

/// `GATEWAY_BACKEND_0_*`, `GATEWAY_BACKEND_1_*`, ... up to the first index
/// with none of its keys set.
fn backends_from_env<F>(env: &Env<F>) -> Vec<Backend>
where
    F: Fn(&str) -> Option<String>,
{
    let mut backends = Vec::new();
    for idx in 0.. {
        let key = |field: &str| format!("BACKEND_{idx}_{field}");
        let name = env.string(&key("NAME"));
        let base_url = env.string(&key("BASE_URL"));
        let api_key = env.string(&key("API_KEY"));
        let models = env.string(&key("ALLOWED_MODELS"));

        if name.is_none() && base_url.is_none() && api_key.is_none() && models.is_none() {
            break;
        }

        backends.push(Backend::new(
            name.unwrap_or_default(),
            base_url.unwrap_or_default(),
            api_key.unwrap_or_default(),
            models.as_deref().map(parse_allowed_models).unwrap_or_default(),
        ));
    }
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    const ONE_BACKEND: &[(&str, &str)] = &[
        ("GATEWAY_BACKEND_0_NAME", "openai"),
        ("GATEWAY_BACKEND_0_BASE_URL", "https://api.openai.com/v1"),
        ("GATEWAY_BACKEND_0_API_KEY", "sk-test"),
        ("GATEWAY_BACKEND_0_ALLOWED_MODELS", "gpt-4o, gpt-4o-mini,, "),
    ];

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = load(ONE_BACKEND).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path_prefix, "/openai/v1");
        assert_eq!(cfg.max_request_bytes, 26_214_400);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
        assert_eq!(cfg.rate_limit_max_requests, 0);
        assert_eq!(cfg.metrics_addr, Some("0.0.0.0:9090".parse().unwrap()));
        assert!(!cfg.trust_proxy_headers);
        cfg.validate().unwrap();
    }

    #[test]
    fn backends_are_read_until_first_gap() {
        let mut vars = ONE_BACKEND.to_vec();
        vars.extend_from_slice(&[
            ("GATEWAY_BACKEND_1_NAME", "local"),
            ("GATEWAY_BACKEND_1_BASE_URL", "http://localhost:11434/v1/"),
            ("GATEWAY_BACKEND_1_API_KEY", "unused"),
            ("GATEWAY_BACKEND_1_ALLOWED_MODELS", "llama3"),
            ("GATEWAY_BACKEND_3_NAME", "skipped"),
        ]);
        let cfg = load(&vars).unwrap();

        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].allowed_models, vec!["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(cfg.backends[1].name, "local");
        cfg.validate().unwrap();
    }

    #[test]
    fn partially_configured_backend_fails_validation() {
        let cfg = load(&[
            ("GATEWAY_BACKEND_0_NAME", "openai"),
            ("GATEWAY_BACKEND_0_API_KEY", "sk"),
        ])
        .unwrap();
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingBaseUrl("openai".to_string()))
        );
    }

    #[test]
    fn no_backends_fails_validation() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.validate(), Err(ConfigError::NoBackends));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = ONE_BACKEND.to_vec();
        vars.extend_from_slice(&[
            ("GATEWAY_HOST", "0.0.0.0"),
            ("GATEWAY_PORT", "9000"),
            ("GATEWAY_PATH_PREFIX", "/api/v1/"),
            ("GATEWAY_METRICS_ADDR", ""),
            ("GATEWAY_RATE_LIMIT_MAX_REQUESTS", "20"),
            ("GATEWAY_RATE_LIMIT_WINDOW_SECS", "5"),
            ("GATEWAY_TRUST_PROXY_HEADERS", "yes"),
            ("GATEWAY_TRUSTED_PROXY_CIDRS", "10.0.0.0/8, 192.168.0.0/16 127.0.0.1/32"),
        ]);
        let cfg = load(&vars).unwrap();

        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.path_prefix, "/api/v1");
        assert_eq!(cfg.metrics_addr, None);
        assert_eq!(cfg.rate_limit_max_requests, 20);
        assert_eq!(cfg.rate_limit_window, Duration::from_secs(5));
        assert!(cfg.trust_proxy_headers);
        assert_eq!(cfg.trusted_proxy_cidrs.len(), 3);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for (name, value) in [
            ("GATEWAY_PORT", "http"),
            ("GATEWAY_PORT", "70000"),
            ("GATEWAY_MAX_REQUEST_BYTES", "-1"),
            ("GATEWAY_TRUST_PROXY_HEADERS", "maybe"),
            ("GATEWAY_TRUSTED_PROXY_CIDRS", "10.0.0.0/33"),
            ("GATEWAY_METRICS_ADDR", "nowhere"),
        ] {
            let err = load(&[(name, value)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidSetting { name: ref n, .. } if n == name),
                "{name}={value}: {err}"
            );
        }
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut vars = ONE_BACKEND.to_vec();
        vars.push(("GATEWAY_PORT", "0"));
        let err = load(&vars).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[test]
    fn debug_output_redacts_backend_keys() {
        let cfg = load(ONE_BACKEND).unwrap();
        assert!(!format!("{cfg:?}").contains("sk-test"));
    }
}
