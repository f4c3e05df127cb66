//! Default values and sanitisation for resolved settings.

use std::path::{Path, PathBuf};

use crate::models::{default_cache_dir, AcceleratorOptions};

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

impl AcceleratorOptions {
    /// Normalise paths loaded from a config file, recording what was changed.
    pub(crate) fn sanitize(&mut self, warnings: &mut Vec<String>) {
        if let Some(dir) = self.kernel_dir.take() {
            if dir.as_os_str().is_empty() {
                warnings.push("accelerator.kernel_dir is empty; using embedded kernels".to_string());
            } else {
                self.kernel_dir = Some(expand_home(&dir));
            }
        }

        if self.cache_dir.as_os_str().is_empty() {
            warnings.push(format!(
                "accelerator.cache_dir is empty; using {}",
                default_cache_dir().display()
            ));
            self.cache_dir = default_cache_dir();
        } else {
            self.cache_dir = expand_home(&self.cache_dir);
        }
    }
}
