//! Pipeline behaviour tests: resource tracking, fault injection, and
//! parity between the host and GPU backends.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::*;
use crate::mask::Threshold;
use crate::models::{AcceleratorOptions, ImageDims, MaskOptions, PixelImage};

// ============================================================================
// Resource-tracking test double
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    Never,
    Enqueue(Kernel),
    CreateOutput(&'static str),
    ShortOutput(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Alloc(&'static str),
    Release(&'static str),
    Enqueue(Kernel),
    Finish,
    ReadBack,
}

struct TrackedBuffer {
    inner: HostBuffer,
    label: &'static str,
}

/// Host backend that records every call and fails on demand.
struct TrackingBackend {
    inner: HostBackend,
    fail: FailPoint,
    events: RefCell<Vec<Event>>,
    enqueue_errors: Cell<usize>,
}

impl TrackingBackend {
    fn new(fail: FailPoint) -> Self {
        Self {
            inner: HostBackend::new(),
            fail,
            events: RefCell::new(Vec::new()),
            enqueue_errors: Cell::new(0),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn count(&self, event: Event) -> usize {
        self.events.borrow().iter().filter(|e| **e == event).count()
    }

    fn position(&self, event: Event) -> usize {
        self.events
            .borrow()
            .iter()
            .position(|e| *e == event)
            .unwrap_or_else(|| panic!("{:?} never happened", event))
    }

    /// Every allocated buffer was released exactly once.
    fn assert_balanced(&self) {
        let mut balance: HashMap<&'static str, i32> = HashMap::new();
        for event in self.events.borrow().iter() {
            match event {
                Event::Alloc(label) => *balance.entry(*label).or_default() += 1,
                Event::Release(label) => *balance.entry(*label).or_default() -= 1,
                _ => {}
            }
        }
        for (label, count) in balance {
            assert_eq!(count, 0, "buffer {} released {} time(s) too few", label, count);
        }
        assert_eq!(self.inner.live_buffers(), 0);
    }
}

impl ComputeBackend for TrackingBackend {
    type Buffer = TrackedBuffer;
    type Binding = HostBinding;

    fn device_kind(&self) -> DeviceKind {
        self.inner.device_kind()
    }

    fn create_input(
        &self,
        label: &'static str,
        pixels: &[u8],
        residency: Residency,
    ) -> Result<TrackedBuffer, GpuError> {
        let inner = self.inner.create_input(label, pixels, residency)?;
        self.record(Event::Alloc(label));
        Ok(TrackedBuffer { inner, label })
    }

    fn create_output(
        &self,
        label: &'static str,
        len: u64,
        access: Access,
        residency: Residency,
    ) -> Result<TrackedBuffer, GpuError> {
        let len = match self.fail {
            FailPoint::CreateOutput(target) if target == label => {
                return Err(GpuError::AllocationFailed {
                    what: label.to_string(),
                    reason: "injected".to_string(),
                })
            }
            FailPoint::ShortOutput(target) if target == label => len - 1,
            _ => len,
        };
        let inner = self.inner.create_output(label, len, access, residency)?;
        self.record(Event::Alloc(label));
        Ok(TrackedBuffer { inner, label })
    }

    fn buffer_len(&self, buffer: &TrackedBuffer) -> u64 {
        self.inner.buffer_len(&buffer.inner)
    }

    fn bind(
        &self,
        kernel: Kernel,
        src: &TrackedBuffer,
        dst: &TrackedBuffer,
        dims: &ImageDims,
    ) -> Result<HostBinding, GpuError> {
        self.inner.bind(kernel, &src.inner, &dst.inner, dims)
    }

    fn enqueue(
        &self,
        kernel: Kernel,
        binding: &HostBinding,
        work_items: u32,
    ) -> Result<(), GpuError> {
        if self.fail == FailPoint::Enqueue(kernel) {
            return Err(GpuError::native(-5, format!("enqueue {}", kernel), "injected"));
        }
        self.record(Event::Enqueue(kernel));
        self.inner
            .enqueue(kernel, binding, work_items)
            .inspect_err(|_| self.enqueue_errors.set(self.enqueue_errors.get() + 1))
    }

    fn finish(&self) -> Result<(), GpuError> {
        self.record(Event::Finish);
        self.inner.finish()
    }

    fn read_back(&self, buffer: &TrackedBuffer, len: usize) -> Result<Vec<u8>, GpuError> {
        self.record(Event::ReadBack);
        self.inner.read_back(&buffer.inner, len)
    }

    fn release(&self, buffer: TrackedBuffer) {
        self.record(Event::Release(buffer.label));
        self.inner.release(buffer.inner);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Generate a test gradient image
fn gradient(width: u32, height: u32, channels: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * channels as u32) as usize);
    for y in 0..height {
        for x in 0..width {
            for c in 0..channels as u32 {
                data.push(((x * 37 + y * 11 + c * 71) % 256) as u8);
            }
        }
    }
    data
}

/// 4x4 RGB image whose top-left quadrant is bright and the rest dark.
fn quadrant_image() -> Vec<u8> {
    let mut data = Vec::with_capacity(4 * 4 * 3);
    for y in 0..4 {
        for x in 0..4 {
            let v = if x < 2 && y < 2 { 200 } else { 20 };
            data.extend([v, v, v]);
        }
    }
    data
}

// ============================================================================
// Pipeline ordering and resource lifetime
// ============================================================================

#[test]
fn test_run_releases_everything_once() {
    let backend = TrackingBackend::new(FailPoint::Never);
    let data = gradient(8, 5, 3);
    let image = PixelImage::new(&data, 8, 5, 3).unwrap();

    let ratios = KernelPipeline::new(&backend).run(image).unwrap();
    assert_eq!(ratios.first.len(), 40);
    assert_eq!(ratios.second.len(), 40);

    backend.assert_balanced();
    assert_eq!(backend.enqueue_errors.get(), 0);
    assert_eq!(backend.count(Event::Enqueue(Kernel::Ratio)), 2);
    assert_eq!(backend.count(Event::ReadBack), 2);
}

#[test]
fn test_stage_order_and_early_releases() {
    let backend = TrackingBackend::new(FailPoint::Never);
    let data = gradient(4, 4, 3);
    let image = PixelImage::new(&data, 4, 4, 3).unwrap();
    KernelPipeline::new(&backend).run(image).unwrap();

    let convert1 = backend.position(Event::Enqueue(Kernel::Convert1));
    let numeric1_freed = backend.position(Event::Release("numeric1"));
    let convert2 = backend.position(Event::Enqueue(Kernel::Convert2));
    let input_freed = backend.position(Event::Release("input"));

    assert!(convert1 < numeric1_freed);
    assert!(numeric1_freed < convert2);
    assert!(convert2 < input_freed);

    // Every dispatch is followed by a barrier before anything else is enqueued.
    let events = backend.events();
    for (i, event) in events.iter().enumerate() {
        if let Event::Enqueue(_) = event {
            let next_enqueue = events[i + 1..]
                .iter()
                .position(|e| matches!(e, Event::Enqueue(_)));
            let next_finish = events[i + 1..].iter().position(|e| *e == Event::Finish);
            assert!(next_finish.is_some());
            if let (Some(enqueue), Some(finish)) = (next_enqueue, next_finish) {
                assert!(finish < enqueue, "enqueue at {} not followed by finish", i);
            }
        }
    }
}

#[test]
fn test_stepwise_buffer_liveness() {
    let backend = HostBackend::new();
    let data = gradient(3, 3, 3);
    let image = PixelImage::new(&data, 3, 3, 3).unwrap();
    let pipeline = KernelPipeline::new(&backend);
    let mut run = pipeline.start(image);

    assert_eq!(run.state(), PipelineState::Idle);
    assert!(run.buffers().is_none());

    assert_eq!(run.advance().unwrap(), PipelineState::BuffersReady);
    assert_eq!(backend.live_buffers(), 4);

    assert_eq!(run.advance().unwrap(), PipelineState::Stage1Dispatched);
    assert_eq!(run.advance().unwrap(), PipelineState::Stage1Reduced);
    let buffers = run.buffers().unwrap();
    assert!(!buffers.is_live(Slot::Numeric1));
    assert!(buffers.is_live(Slot::Input));

    assert_eq!(run.advance().unwrap(), PipelineState::Stage2ADispatched);
    assert!(!run.buffers().unwrap().is_live(Slot::Input));

    assert_eq!(run.advance().unwrap(), PipelineState::Stage2AReduced);
    assert_eq!(run.advance().unwrap(), PipelineState::Stage2BDispatched);
    assert_eq!(backend.live_buffers(), 0);

    assert_eq!(run.advance().unwrap(), PipelineState::Done);
    assert_eq!(run.advance().unwrap(), PipelineState::Done);
    assert!(run.into_ratio_images().is_ok());
}

// ============================================================================
// Fault injection
// ============================================================================

#[test]
fn test_stage2_dispatch_failure_releases_all_buffers() {
    let backend = TrackingBackend::new(FailPoint::Enqueue(Kernel::Convert2));
    let data = gradient(4, 4, 3);
    let image = PixelImage::new(&data, 4, 4, 3).unwrap();

    let err = KernelPipeline::new(&backend).run(image).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineState::Stage2ADispatched));
    assert_eq!(err.native_code(), Some(-5));
    assert!(matches!(err.root(), GpuError::NativeCallFailed { .. }));

    // numeric1 went on the normal path, the rest on the failure path.
    for label in ["input", "numeric1", "numeric2", "scalar"] {
        assert_eq!(backend.count(Event::Release(label)), 1, "{}", label);
    }
    assert!(backend.position(Event::Release("numeric1")) < backend.position(Event::Release("input")));
    assert_eq!(backend.enqueue_errors.get(), 0);
    backend.assert_balanced();
}

#[test]
fn test_stage1_ratio_failure_names_stage() {
    let backend = TrackingBackend::new(FailPoint::Enqueue(Kernel::Ratio));
    let data = gradient(2, 2, 3);
    let image = PixelImage::new(&data, 2, 2, 3).unwrap();

    let err = KernelPipeline::new(&backend).run(image).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineState::Stage1Reduced));
    backend.assert_balanced();
}

#[test]
fn test_partial_allocation_is_released() {
    let backend = TrackingBackend::new(FailPoint::CreateOutput("scalar"));
    let data = gradient(2, 2, 3);
    let image = PixelImage::new(&data, 2, 2, 3).unwrap();

    let err = KernelPipeline::new(&backend).run(image).unwrap_err();
    assert_eq!(err.stage(), Some(PipelineState::BuffersReady));
    assert!(matches!(err.root(), GpuError::AllocationFailed { .. }));
    assert_eq!(backend.count(Event::Alloc("numeric2")), 1);
    backend.assert_balanced();
}

#[test]
fn test_mis_sized_buffer_caught_before_dispatch() {
    let backend = TrackingBackend::new(FailPoint::ShortOutput("numeric2"));
    let data = gradient(3, 2, 3);
    let image = PixelImage::new(&data, 3, 2, 3).unwrap();

    let err = KernelPipeline::new(&backend).run(image).unwrap_err();
    assert!(matches!(
        err.root(),
        GpuError::BufferSizeMismatch {
            slot: "numeric2",
            expected: 24,
            actual: 23
        }
    ));
    assert!(!backend
        .events()
        .iter()
        .any(|e| matches!(e, Event::Enqueue(_))));
    backend.assert_balanced();
}

#[test]
fn test_unsupported_device_fails_before_allocation() {
    let backend = HostBackend::new().with_kind(DeviceKind::Other);
    let data = gradient(2, 2, 3);
    let image = PixelImage::new(&data, 2, 2, 3).unwrap();

    let err = process_image(&backend, image, &MaskOptions::default()).unwrap_err();
    assert!(matches!(err.root(), GpuError::UnsupportedDeviceType { .. }));
    assert_eq!(backend.live_buffers(), 0);
}

// ============================================================================
// Results
// ============================================================================

#[test]
fn test_one_by_one_image() {
    let backend = HostBackend::new();
    let data = [90u8, 30, 10];
    let image = PixelImage::new(&data, 1, 1, 3).unwrap();

    let mask = process_image(&backend, image, &MaskOptions::default()).unwrap();
    assert_eq!((mask.width(), mask.height()), (1, 1));
    assert!(matches!(mask.as_raw()[0], 0 | 255));
}

#[test]
fn test_quadrant_mask_with_identity_kernels() {
    let backend = HostBackend::with_kernels(HostKernels::identity());
    let data = quadrant_image();
    let image = PixelImage::new(&data, 4, 4, 3).unwrap();

    for threshold in [Threshold::Otsu, Threshold::Fixed(127)] {
        let mask = process_image(&backend, image, &MaskOptions { threshold }).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(mask.is_shadow(x, y), x < 2 && y < 2, "pixel ({}, {})", x, y);
            }
        }
    }
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn test_runs_are_deterministic() {
    let backend = HostBackend::new();
    let data = gradient(17, 9, 4);
    let image = PixelImage::new(&data, 17, 9, 4).unwrap();
    let options = MaskOptions::default();

    let first = process_image(&backend, image, &options).unwrap();
    let second = process_image(&backend, image, &options).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_copied_and_mapped_residency_agree() {
    let data = gradient(6, 6, 3);
    let image = PixelImage::new(&data, 6, 6, 3).unwrap();

    let mapped = KernelPipeline::new(&HostBackend::new()).run(image).unwrap();
    let copied = KernelPipeline::new(&HostBackend::new().with_kind(DeviceKind::Discrete))
        .run(image)
        .unwrap();
    assert_eq!(mapped, copied);
}

#[test]
fn test_ratio_images_match_reference_kernels() {
    let data = gradient(5, 3, 3);
    let dims = ImageDims::new(5, 3, 3).unwrap();
    let image = PixelImage::new(&data, 5, 3, 3).unwrap();

    let ratios = KernelPipeline::new(&HostBackend::new()).run(image).unwrap();
    assert_eq!(ratios.first, ratio_bytes(&convert_intensity(&data, &dims)));
    assert_eq!(ratios.second, ratio_bytes(&convert_value(&data, &dims)));
}

#[test]
fn test_shared_host_backend_parallel_runs() {
    use rayon::prelude::*;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    let backend = Arc::new(HostBackend::new());
    let data = Arc::new(gradient(256, 256, 3));
    let expected = {
        let image = PixelImage::new(&data, 256, 256, 3).unwrap();
        process_image(&*backend, image, &MaskOptions::default()).unwrap()
    };

    let (tx, rx) = mpsc::channel();
    let worker_backend = Arc::clone(&backend);
    std::thread::spawn(move || {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(8)
            .build()
            .expect("thread pool");
        let masks: Vec<_> = pool.install(|| {
            (0..32)
                .into_par_iter()
                .map(|_| {
                    let image = PixelImage::new(&data, 256, 256, 3).unwrap();
                    process_image(&*worker_backend, image, &MaskOptions::default())
                })
                .collect()
        });
        let _ = tx.send(masks);
    });

    let masks = rx
        .recv_timeout(Duration::from_secs(60))
        .expect("parallel runs on one backend did not finish");
    assert_eq!(masks.len(), 32);
    for mask in masks {
        assert_eq!(mask.unwrap(), expected);
    }
    assert_eq!(backend.live_buffers(), 0);
}

// ============================================================================
// Program cache fallback produces identical output
// ============================================================================

/// Builds host kernel tables through the program cache.
struct HostProgramBuilder;

const HOST_BINARY: &[u8] = b"host:shadow_ratio:v1";

impl ProgramBuilder for HostProgramBuilder {
    type Program = HostKernels;

    fn device_name(&self) -> Result<String, GpuError> {
        Ok("Host CPU".to_string())
    }

    fn build_from_binary(&self, binary: &[u8]) -> Result<HostKernels, GpuError> {
        if binary == HOST_BINARY {
            Ok(HostKernels::reference())
        } else {
            Err(GpuError::native(-42, "build binary", "invalid binary"))
        }
    }

    fn build_from_source(&self, source: &str) -> Result<HostKernels, GpuError> {
        if Kernel::ALL.iter().all(|k| source.contains(k.entry_point())) {
            Ok(HostKernels::reference())
        } else {
            Err(GpuError::KernelCompileError {
                kernel_set: KERNEL_SET.to_string(),
                log: "missing entry point".to_string(),
            })
        }
    }

    fn program_binary(&self, _program: &HostKernels) -> Result<Vec<u8>, GpuError> {
        Ok(HOST_BINARY.to_vec())
    }
}

#[test]
fn test_corrupt_binary_gives_identical_mask() {
    let cache_dir = tempfile::tempdir().expect("temp dir");
    let programs = ProgramCache::new(true, cache_dir.path(), KernelSource::Embedded);
    let data = gradient(8, 8, 3);
    let image = PixelImage::new(&data, 8, 8, 3).unwrap();
    let options = MaskOptions::default();

    let (kernels, origin) = programs.ensure_program(&HostProgramBuilder, KERNEL_SET).unwrap();
    assert_eq!(origin, ProgramOrigin::Source { persisted: true });
    let compiled = process_image(&HostBackend::with_kernels(kernels), image, &options).unwrap();

    let (kernels, origin) = programs.ensure_program(&HostProgramBuilder, KERNEL_SET).unwrap();
    assert_eq!(origin, ProgramOrigin::Binary);
    let cached = process_image(&HostBackend::with_kernels(kernels), image, &options).unwrap();

    let artifact = programs.artifact_path("Host CPU", KERNEL_SET);
    std::fs::write(&artifact, b"\0corrupt").unwrap();
    let (kernels, origin) = programs.ensure_program(&HostProgramBuilder, KERNEL_SET).unwrap();
    assert_eq!(origin, ProgramOrigin::Source { persisted: true });
    let recovered = process_image(&HostBackend::with_kernels(kernels), image, &options).unwrap();

    std::fs::remove_file(&artifact).unwrap();
    let (kernels, _) = programs.ensure_program(&HostProgramBuilder, KERNEL_SET).unwrap();
    let rebuilt = process_image(&HostBackend::with_kernels(kernels), image, &options).unwrap();

    assert_eq!(compiled, cached);
    assert_eq!(cached, recovered);
    assert_eq!(recovered, rebuilt);
}

// ============================================================================
// GPU parity (skipped without an adapter)
// ============================================================================

fn gpu_options(cache_dir: &std::path::Path) -> AcceleratorOptions {
    AcceleratorOptions {
        cache_dir: cache_dir.to_path_buf(),
        ..AcceleratorOptions::default()
    }
}

#[test]
fn test_gpu_available() {
    if !is_gpu_available() {
        eprintln!("GPU not available, skipping GPU tests");
        return;
    }
    let info = gpu_info();
    assert!(info.is_some());
    eprintln!("GPU: {}", info.unwrap());
}

#[test]
fn test_gpu_host_parity() {
    if !is_gpu_available() {
        eprintln!("GPU not available, skipping parity test");
        return;
    }
    let cache_dir = tempfile::tempdir().expect("temp dir");
    let ctx = match GpuContext::from_options(&gpu_options(cache_dir.path())) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Could not open GPU context ({}), skipping parity test", e);
            return;
        }
    };
    if ctx.device_kind().residency().is_err() {
        eprintln!("Adapter type has no allocation strategy, skipping parity test");
        return;
    }

    // Odd sizes exercise the padded tail of every packed buffer.
    for (w, h, c) in [(1, 1, 3), (7, 5, 1), (33, 17, 3), (64, 48, 4)] {
        let data = gradient(w, h, c);
        let image = PixelImage::new(&data, w, h, c).unwrap();

        let gpu = KernelPipeline::new(&ctx).run(image).expect("GPU run");
        let host = KernelPipeline::new(&HostBackend::new()).run(image).unwrap();
        assert_eq!(gpu, host, "ratio mismatch for {}x{}x{}", w, h, c);
    }
}

#[test]
fn test_gpu_program_binary_reused() {
    if !is_gpu_available() {
        eprintln!("GPU not available, skipping program cache test");
        return;
    }
    let cache_dir = tempfile::tempdir().expect("temp dir");
    let options = gpu_options(cache_dir.path());

    let first = match GpuContext::from_options(&options) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Could not open GPU context ({}), skipping program cache test", e);
            return;
        }
    };
    assert!(matches!(first.program_origin(), ProgramOrigin::Source { .. }));
    assert!(first.work_group_size(Kernel::Ratio) <= 256);

    let data = gradient(16, 16, 3);
    let image = PixelImage::new(&data, 16, 16, 3).unwrap();
    if first.device_kind().residency().is_err() {
        return;
    }
    let expected = process_image(&first, image, &MaskOptions::default()).unwrap();
    let persisted = first.program_origin() == ProgramOrigin::Source { persisted: true };
    drop(first);

    let second = GpuContext::from_options(&options).expect("reopen GPU context");
    if persisted {
        assert_eq!(second.program_origin(), ProgramOrigin::Binary);
    }
    let actual = process_image(&second, image, &MaskOptions::default()).unwrap();
    assert_eq!(expected, actual);
}
