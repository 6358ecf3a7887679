//! Runtime configuration.
//!
//! `GLAS_CONF` names the configuration file; the default location is
//! `~/.config/glas/conf.glas`. The runtime reads only its own tuning
//! table from the file (TOML); everything else in a configuration is the
//! loader's business. Environment variables override file settings.

use glas_core::rt::rt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Once;
use std::sync::atomic::Ordering;

/// Tuning knobs readable from the configuration file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct GlasConfig {
    /// Every n-th background GC cycle is a full collection.
    pub gc_full_interval: Option<u32>,
    /// Collections a page must survive before promotion.
    pub gc_promote_cycles: Option<u32>,
    /// Fresh pages between heuristic collection triggers.
    pub gc_page_trigger: Option<usize>,
    /// Cell allocations allowed per step before E_QUOTA.
    pub step_quota: Option<usize>,
    /// Post-commit queue bound (committers stall above it).
    pub postop_queue_bound: Option<usize>,
}

/// Resolve the configuration file path: `GLAS_CONF`, else the per-user
/// default.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GLAS_CONF") {
        return Some(PathBuf::from(path));
    }
    home::home_dir().map(|h| h.join(".config").join("glas").join("conf.glas"))
}

/// Load the tuning table from the configuration file, if present and
/// parseable. Unreadable configuration is reported and ignored.
pub fn load() -> GlasConfig {
    let Some(path) = config_path() else {
        return GlasConfig::default();
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return GlasConfig::default();
    };
    match toml::from_str(&text) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!(?path, %err, "ignoring unparseable configuration");
            GlasConfig::default()
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

/// Write a configuration into the runtime's tuning knobs. Environment
/// variables override file settings.
pub fn apply(cfg: &GlasConfig) {
    let t = &rt().tuning;
    if let Some(n) = env_u32("GLAS_GC_FULL_INTERVAL").or(cfg.gc_full_interval) {
        t.gc_full_interval.store(n, Ordering::Relaxed);
    }
    if let Some(n) = env_u32("GLAS_GC_PROMOTE_CYCLES").or(cfg.gc_promote_cycles) {
        t.gc_promote_cycles.store(n, Ordering::Relaxed);
    }
    if let Some(n) = env_usize("GLAS_GC_PAGE_TRIGGER").or(cfg.gc_page_trigger) {
        t.gc_page_trigger.store(n, Ordering::Relaxed);
    }
    if let Some(n) = env_usize("GLAS_STEP_QUOTA").or(cfg.step_quota) {
        t.step_quota.store(n, Ordering::Relaxed);
    }
    if let Some(n) = env_usize("GLAS_POSTOP_QUEUE_BOUND").or(cfg.postop_queue_bound) {
        t.postop_queue_bound.store(n, Ordering::Relaxed);
    }
}

static APPLIED: Once = Once::new();

/// Load and apply the user configuration once per process. Called on the
/// first context creation; explicit `apply` calls can still retune later.
pub fn ensure_applied() {
    APPLIED.call_once(|| {
        let cfg = load();
        apply(&cfg);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tuning_table() {
        let cfg: GlasConfig =
            toml::from_str("gc_full_interval = 2\nstep_quota = 4096\n").expect("parse");
        assert_eq!(cfg.gc_full_interval, Some(2));
        assert_eq!(cfg.step_quota, Some(4096));
        assert_eq!(cfg.postop_queue_bound, None);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let cfg: Result<GlasConfig, _> = toml::from_str("apps = { hello = \"x\" }\n");
        assert!(cfg.is_ok());
    }
}
