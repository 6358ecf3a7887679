//! Configuration loading and the loader hook.

use glas_runtime::config;
use glas_runtime::core::rt::rt;
use serial_test::serial;
use std::io::Write;
use std::sync::atomic::Ordering;

#[test]
#[serial]
fn glas_conf_env_names_the_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "gc_full_interval = 7\nstep_quota = 123456").expect("write");
    // SAFETY: tests in this binary are serialized
    unsafe { std::env::set_var("GLAS_CONF", file.path()) };
    let cfg = config::load();
    unsafe { std::env::remove_var("GLAS_CONF") };
    assert_eq!(cfg.gc_full_interval, Some(7));
    assert_eq!(cfg.step_quota, Some(123456));
}

#[test]
#[serial]
fn apply_updates_tuning_knobs() {
    let old_quota = rt().tuning.step_quota.load(Ordering::Relaxed);
    let cfg = config::GlasConfig {
        step_quota: Some(4_000_000),
        ..Default::default()
    };
    config::apply(&cfg);
    assert_eq!(rt().tuning.step_quota.load(Ordering::Relaxed), 4_000_000);
    // restore so other tests keep their quota
    rt().tuning.step_quota.store(old_quota, Ordering::Relaxed);
}

#[test]
#[serial]
fn unreadable_config_is_ignored() {
    unsafe { std::env::set_var("GLAS_CONF", "/nonexistent/glas/conf.glas") };
    let cfg = config::load();
    unsafe { std::env::remove_var("GLAS_CONF") };
    assert!(cfg.gc_full_interval.is_none());
}

#[test]
#[serial]
fn vfs_hook_installs_once_and_replaces() {
    glas_runtime::vfs_intercept(Box::new(|path| {
        (path == "hello.g").then(|| b"data".to_vec())
    }));
    let vfs = rt().vfs.lock().expect("vfs lock");
    let cb = vfs.as_ref().expect("installed");
    assert_eq!(cb("hello.g"), Some(b"data".to_vec()));
    assert_eq!(cb("other.g"), None);
}
