use std::time::Duration;

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env_var(key).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

/// Deployment configuration. Capability toggles live here rather than being
/// read from the environment at request time; `from_env` applies overrides
/// once at startup.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// When false, blob and manifest DELETE answer 405 Method Not Allowed.
    pub enable_delete: bool,
    /// When true, a mount request without a `from` repository may be
    /// satisfied by any repository holding the digest.
    pub auto_mount_discovery: bool,
    /// When true, `?artifactType=` on the referrers endpoint is applied
    /// server-side and signalled with OCI-Filters-Applied. When false the
    /// full list is returned and clients filter themselves.
    pub filter_referrers: bool,
    /// Stale upload sessions older than this are reaped.
    pub upload_session_max_age: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            enable_delete: true,
            auto_mount_discovery: false,
            filter_referrers: true,
            upload_session_max_age: Duration::from_secs(30 * 60),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        let mut config = RegistryConfig::default();
        if let Some(disabled) = env_flag("QUAYSIDE_DISABLE_DELETE") {
            config.enable_delete = !disabled;
        }
        if let Some(enabled) = env_flag("QUAYSIDE_AUTO_MOUNT_DISCOVERY") {
            config.auto_mount_discovery = enabled;
        }
        if let Some(enabled) = env_flag("QUAYSIDE_FILTER_REFERRERS") {
            config.filter_referrers = enabled;
        }
        if let Some(secs) = env_var("QUAYSIDE_UPLOAD_SESSION_MAX_AGE_SECS") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                config.upload_session_max_age = Duration::from_secs(secs);
            }
        }
        config
    }
}
