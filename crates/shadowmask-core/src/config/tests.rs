use std::path::PathBuf;

use super::*;
use crate::gpu::DeviceClass;
use crate::mask::Threshold;

fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("shadowmask.yml");
    fs::write(&path, contents).expect("write config");
    (dir, path)
}

#[test]
fn test_defaults() {
    let config = ShadowmaskConfig::default();
    assert!(config.accelerator.use_precompiled_kernels);
    assert_eq!(config.accelerator.device_class, DeviceClass::Auto);
    assert_eq!(config.accelerator.platform_index, 0);
    assert_eq!(config.accelerator.device_index, 0);
    assert!(config.accelerator.kernel_dir.is_none());
    assert!(config.accelerator.cache_dir.ends_with("kernels"));
    assert_eq!(config.mask.threshold, Threshold::Otsu);
}

#[test]
fn test_load_custom_path() {
    let (_dir, path) = write_config(
        "accelerator:\n  use_precompiled_kernels: false\n  device_class: cpu\n  device_index: 2\n  cache_dir: /tmp/sm-cache\nmask:\n  threshold: 96\n",
    );
    let handle = load_config(Some(&path));

    assert!(handle.source.is_some());
    let config = handle.config;
    assert!(!config.accelerator.use_precompiled_kernels);
    assert_eq!(config.accelerator.device_class, DeviceClass::Cpu);
    assert_eq!(config.accelerator.device_index, 2);
    assert_eq!(config.accelerator.platform_index, 0);
    assert_eq!(config.accelerator.cache_dir, PathBuf::from("/tmp/sm-cache"));
    assert_eq!(config.mask.threshold, Threshold::Fixed(96));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let (_dir, path) = write_config("mask:\n  threshold: otsu\n");
    let config = load_config(Some(&path)).config;
    assert!(config.accelerator.use_precompiled_kernels);
    assert_eq!(config.mask.threshold, Threshold::Otsu);
}

#[test]
fn test_invalid_file_warns() {
    let (_dir, path) = write_config("mask:\n  threshold: 999\n");
    let handle = load_config(Some(&path));
    assert!(handle
        .warnings
        .iter()
        .any(|w| w.contains("Failed to parse config")));
}

#[test]
fn test_missing_custom_path_warns() {
    let dir = tempfile::tempdir().unwrap();
    let handle = load_config(Some(&dir.path().join("absent.yml")));
    assert!(handle.warnings.iter().any(|w| w.contains("does not exist")));
}

#[test]
fn test_empty_paths_are_sanitized() {
    let (_dir, path) = write_config("accelerator:\n  kernel_dir: \"\"\n  cache_dir: \"\"\n");
    let handle = load_config(Some(&path));
    assert!(handle.config.accelerator.kernel_dir.is_none());
    assert!(!handle.config.accelerator.cache_dir.as_os_str().is_empty());
    assert_eq!(handle.warnings.len(), 2);
}

#[test]
fn test_expand_home() {
    let plain = PathBuf::from("/opt/kernels");
    assert_eq!(defaults::expand_home(&plain), plain);
    if let Some(home) = dirs::home_dir() {
        assert_eq!(
            defaults::expand_home(&PathBuf::from("~/kernels")),
            home.join("kernels")
        );
    }
}
