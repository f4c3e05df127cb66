//! Program loading with a persisted binary cache and source fallback.
//!
//! Binaries live at `{cache_dir}/{device}_{kernel_set}.bin`. Anything wrong
//! with a cached binary is a cache miss, never an error: the program is then
//! rebuilt from source and, if enabled, persisted again for the next run.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::error::GpuError;
use super::shaders;
use crate::models::AcceleratorOptions;

/// Extension of persisted program binaries.
pub const BINARY_EXTENSION: &str = "bin";
/// Extension of kernel source files in a kernel directory.
pub const SOURCE_EXTENSION: &str = "wgsl";

/// Device-specific program construction.
pub trait ProgramBuilder {
    type Program;

    /// Name used to key persisted binaries.
    fn device_name(&self) -> Result<String, GpuError>;

    /// Rebuild a program from bytes produced by [`program_binary`](Self::program_binary).
    fn build_from_binary(&self, binary: &[u8]) -> Result<Self::Program, GpuError>;

    /// Compile kernel source. Failures carry the compiler log.
    fn build_from_source(&self, source: &str) -> Result<Self::Program, GpuError>;

    /// Serialise a built program for persistence.
    fn program_binary(&self, program: &Self::Program) -> Result<Vec<u8>, GpuError>;
}

/// Where kernel source text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// Source compiled into the library.
    Embedded,
    /// `{dir}/{kernel_set}.wgsl` on disk.
    Directory(PathBuf),
}

impl KernelSource {
    pub fn read(&self, kernel_set: &str) -> Result<String, GpuError> {
        match self {
            KernelSource::Embedded => shaders::source_for(kernel_set)
                .map(str::to_string)
                .ok_or_else(|| GpuError::KernelSourceUnreadable {
                    path: PathBuf::from(format!("{}.{}", kernel_set, SOURCE_EXTENSION)),
                    reason: "no embedded kernel set with this name".to_string(),
                }),
            KernelSource::Directory(dir) => {
                let path = dir.join(format!("{}.{}", kernel_set, SOURCE_EXTENSION));
                fs::read_to_string(&path).map_err(|e| GpuError::KernelSourceUnreadable {
                    path,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// How [`ProgramCache::ensure_program`] obtained its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramOrigin {
    /// Loaded from a persisted binary.
    Binary,
    /// Compiled from source; `persisted` says whether a binary was written.
    Source { persisted: bool },
}

#[derive(Debug, Error)]
enum CacheMiss {
    #[error("device name unavailable: {0}")]
    NoDeviceName(GpuError),
    #[error("no binary at {}", .0.display())]
    Missing(PathBuf),
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("binary {} rejected: {source}", path.display())]
    Rejected { path: PathBuf, source: GpuError },
    #[error("program has no binary form: {0}")]
    NoBinary(GpuError),
}

/// Loads programs for a device, caching built binaries on disk.
#[derive(Debug, Clone)]
pub struct ProgramCache {
    use_precompiled: bool,
    cache_dir: PathBuf,
    source: KernelSource,
}

impl ProgramCache {
    pub fn new(use_precompiled: bool, cache_dir: impl Into<PathBuf>, source: KernelSource) -> Self {
        Self {
            use_precompiled,
            cache_dir: cache_dir.into(),
            source,
        }
    }

    pub fn from_options(options: &AcceleratorOptions) -> Self {
        let source = match &options.kernel_dir {
            Some(dir) => KernelSource::Directory(dir.clone()),
            None => KernelSource::Embedded,
        };
        Self::new(options.use_precompiled_kernels, &options.cache_dir, source)
    }

    pub fn use_precompiled(&self) -> bool {
        self.use_precompiled
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Binary path for a device and kernel set.
    pub fn artifact_path(&self, device_name: &str, kernel_set: &str) -> PathBuf {
        self.cache_dir.join(format!(
            "{}_{}.{}",
            sanitize_device_name(device_name),
            kernel_set,
            BINARY_EXTENSION
        ))
    }

    /// Obtain a built program, preferring the persisted binary.
    pub fn ensure_program<B: ProgramBuilder>(
        &self,
        builder: &B,
        kernel_set: &str,
    ) -> Result<(B::Program, ProgramOrigin), GpuError> {
        if self.use_precompiled {
            match self.load_binary(builder, kernel_set) {
                Ok(program) => {
                    info!(kernel_set, "loaded precompiled program");
                    return Ok((program, ProgramOrigin::Binary));
                }
                Err(miss @ CacheMiss::Missing(_)) => {
                    debug!(kernel_set, reason = %miss, "program cache miss");
                }
                Err(miss) => {
                    warn!(kernel_set, reason = %miss, "ignoring cached program");
                }
            }
        }

        let text = self.source.read(kernel_set)?;
        let program = builder.build_from_source(&text)?;
        info!(kernel_set, "compiled program from source");

        let persisted = self.use_precompiled
            && match self.persist_binary(builder, &program, kernel_set) {
                Ok(path) => {
                    info!(path = %path.display(), "persisted program binary");
                    true
                }
                Err(err) => {
                    warn!(kernel_set, reason = %err, "could not persist program binary");
                    false
                }
            };

        Ok((program, ProgramOrigin::Source { persisted }))
    }

    fn load_binary<B: ProgramBuilder>(
        &self,
        builder: &B,
        kernel_set: &str,
    ) -> Result<B::Program, CacheMiss> {
        let name = builder.device_name().map_err(CacheMiss::NoDeviceName)?;
        let path = self.artifact_path(&name, kernel_set);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheMiss::Missing(path)),
            Err(source) => return Err(CacheMiss::Io { path, source }),
        };

        builder
            .build_from_binary(&bytes)
            .map_err(|source| CacheMiss::Rejected { path, source })
    }

    fn persist_binary<B: ProgramBuilder>(
        &self,
        builder: &B,
        program: &B::Program,
        kernel_set: &str,
    ) -> Result<PathBuf, CacheMiss> {
        let name = builder.device_name().map_err(CacheMiss::NoDeviceName)?;
        let binary = builder.program_binary(program).map_err(CacheMiss::NoBinary)?;
        let path = self.artifact_path(&name, kernel_set);

        let written = fs::create_dir_all(&self.cache_dir).and_then(|_| {
            let mut file = fs::File::create(&path)?;
            file.write_all(&binary)?;
            file.sync_all()
        });

        match written {
            Ok(()) => Ok(path),
            Err(source) => {
                // Never leave a truncated binary behind.
                let _ = fs::remove_file(&path);
                Err(CacheMiss::Io { path, source })
            }
        }
    }
}

/// Make a device name safe to use as a file name component.
pub fn sanitize_device_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct FakeProgram(&'static str);

    struct FakeBuilder {
        name: &'static str,
        compiles: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl FakeBuilder {
        fn new() -> Self {
            Self {
                name: "Fake GPU",
                compiles: true,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn called(&self, what: &str) -> bool {
            self.calls.borrow().iter().any(|c| *c == what)
        }
    }

    const GOOD_BINARY: &[u8] = b"FAKEBIN1";

    impl ProgramBuilder for FakeBuilder {
        type Program = FakeProgram;

        fn device_name(&self) -> Result<String, GpuError> {
            Ok(self.name.to_string())
        }

        fn build_from_binary(&self, binary: &[u8]) -> Result<FakeProgram, GpuError> {
            self.calls.borrow_mut().push("binary");
            if binary == GOOD_BINARY {
                Ok(FakeProgram("binary"))
            } else {
                Err(GpuError::native(-42, "build binary", "invalid binary"))
            }
        }

        fn build_from_source(&self, source: &str) -> Result<FakeProgram, GpuError> {
            self.calls.borrow_mut().push("source");
            if self.compiles && !source.is_empty() {
                Ok(FakeProgram("source"))
            } else {
                Err(GpuError::KernelCompileError {
                    kernel_set: "test".into(),
                    log: "error: expected ';'".into(),
                })
            }
        }

        fn program_binary(&self, _program: &FakeProgram) -> Result<Vec<u8>, GpuError> {
            Ok(GOOD_BINARY.to_vec())
        }
    }

    fn source_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("set.wgsl"), "fn main() {}").expect("write source");
        dir
    }

    #[test]
    fn test_miss_compiles_and_persists() {
        let src = source_dir();
        let cache = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(
            true,
            cache.path(),
            KernelSource::Directory(src.path().to_path_buf()),
        );
        let builder = FakeBuilder::new();

        let (program, origin) = programs.ensure_program(&builder, "set").unwrap();
        assert_eq!(program, FakeProgram("source"));
        assert_eq!(origin, ProgramOrigin::Source { persisted: true });

        let path = programs.artifact_path("Fake GPU", "set");
        assert_eq!(fs::read(path).unwrap(), GOOD_BINARY);
    }

    #[test]
    fn test_valid_binary_is_used() {
        let cache = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(true, cache.path(), KernelSource::Directory("/nonexistent".into()));
        fs::write(programs.artifact_path("Fake GPU", "set"), GOOD_BINARY).unwrap();

        let builder = FakeBuilder::new();
        let (program, origin) = programs.ensure_program(&builder, "set").unwrap();
        assert_eq!(program, FakeProgram("binary"));
        assert_eq!(origin, ProgramOrigin::Binary);
        assert!(!builder.called("source"));
    }

    #[test]
    fn test_corrupt_binary_falls_back_to_source() {
        let src = source_dir();
        let cache = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(
            true,
            cache.path(),
            KernelSource::Directory(src.path().to_path_buf()),
        );
        let path = programs.artifact_path("Fake GPU", "set");
        fs::write(&path, b"garbage").unwrap();

        let builder = FakeBuilder::new();
        let (program, origin) = programs.ensure_program(&builder, "set").unwrap();
        assert_eq!(program, FakeProgram("source"));
        assert_eq!(origin, ProgramOrigin::Source { persisted: true });
        // The rebuilt binary replaces the corrupt one.
        assert_eq!(fs::read(path).unwrap(), GOOD_BINARY);
    }

    #[test]
    fn test_unwritable_cache_still_returns_program() {
        let src = source_dir();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        // A regular file where the cache directory should be.
        let programs = ProgramCache::new(
            true,
            blocker.path().join("kernels"),
            KernelSource::Directory(src.path().to_path_buf()),
        );

        let (program, origin) = programs.ensure_program(&FakeBuilder::new(), "set").unwrap();
        assert_eq!(program, FakeProgram("source"));
        assert_eq!(origin, ProgramOrigin::Source { persisted: false });
        assert!(!programs.artifact_path("Fake GPU", "set").exists());
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let cache = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(
            true,
            cache.path(),
            KernelSource::Directory(empty.path().to_path_buf()),
        );
        let err = programs.ensure_program(&FakeBuilder::new(), "set").unwrap_err();
        assert!(matches!(err, GpuError::KernelSourceUnreadable { .. }));
    }

    #[test]
    fn test_compile_error_carries_log() {
        let src = source_dir();
        let cache = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(
            true,
            cache.path(),
            KernelSource::Directory(src.path().to_path_buf()),
        );
        let mut builder = FakeBuilder::new();
        builder.compiles = false;

        let err = programs.ensure_program(&builder, "set").unwrap_err();
        match err {
            GpuError::KernelCompileError { log, .. } => assert!(log.contains("expected ';'")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!programs.artifact_path("Fake GPU", "set").exists());
    }

    #[test]
    fn test_precompiled_disabled_skips_cache() {
        let src = source_dir();
        let cache = tempfile::tempdir().unwrap();
        let programs = ProgramCache::new(
            false,
            cache.path(),
            KernelSource::Directory(src.path().to_path_buf()),
        );
        fs::write(programs.artifact_path("Fake GPU", "set"), GOOD_BINARY).unwrap();

        let builder = FakeBuilder::new();
        let (_, origin) = programs.ensure_program(&builder, "set").unwrap();
        assert_eq!(origin, ProgramOrigin::Source { persisted: false });
        assert!(!builder.called("binary"));
        assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_embedded_source_exists() {
        let text = KernelSource::Embedded.read(crate::gpu::backend::KERNEL_SET).unwrap();
        assert!(text.contains("tsai_ratio"));
        assert!(KernelSource::Embedded.read("missing").is_err());
    }

    #[test]
    fn test_sanitize_device_name() {
        assert_eq!(sanitize_device_name("AMD Radeon/Pro: W6800"), "AMD Radeon_Pro_ W6800");
        assert_eq!(sanitize_device_name("a\\b\tc"), "a_b_c");
        assert_eq!(sanitize_device_name("  "), "unknown");
    }
}
