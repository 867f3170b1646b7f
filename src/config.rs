use std::collections::HashSet;

/// Server configuration, read once from the environment and passed down
/// explicitly. No ambient globals.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    /// Shared service password for pgwire cleartext auth.
    pub password: String,
    /// Usernames granted the admin role.
    pub admins: HashSet<String>,
    pub max_connections: usize,
    /// WAL appends per facility before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Fixed display zone, minutes east of UTC. Applied only when
    /// formatting timestamps at the wire boundary.
    pub display_offset_min: i32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: env_or("VALET_BIND", "0.0.0.0"),
            port: env_parse("VALET_PORT").unwrap_or(5433),
            data_dir: env_or("VALET_DATA_DIR", "./data"),
            password: env_or("VALET_PASSWORD", "valet"),
            admins: std::env::var("VALET_ADMINS")
                .map(|s| parse_admins(&s))
                .unwrap_or_default(),
            max_connections: env_parse("VALET_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parse("VALET_COMPACT_THRESHOLD").unwrap_or(1000),
            display_offset_min: env_parse("VALET_DISPLAY_OFFSET_MIN").unwrap_or(330),
            metrics_port: env_parse("VALET_METRICS_PORT"),
            tls_cert: std::env::var("VALET_TLS_CERT").ok(),
            tls_key: std::env::var("VALET_TLS_KEY").ok(),
        }
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn parse_admins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_parse_trims_and_skips_empty() {
        let admins = parse_admins(" alice, bob ,,carol");
        assert_eq!(admins.len(), 3);
        assert!(admins.contains("alice"));
        assert!(admins.contains("bob"));
        assert!(admins.contains("carol"));
    }

    #[test]
    fn admin_check() {
        let mut cfg = Config {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: "./data".into(),
            password: "valet".into(),
            admins: HashSet::new(),
            max_connections: 256,
            compact_threshold: 1000,
            display_offset_min: 330,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        };
        assert!(!cfg.is_admin("alice"));
        cfg.admins.insert("alice".into());
        assert!(cfg.is_admin("alice"));
    }
}
