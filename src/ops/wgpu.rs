//! GPU execution of elementwise kernels using WGPU.
//!
//! This module owns the process-wide GPU context (created lazily, via
//! `lazy_static`, on the first kernel compilation) and turns an
//! [`ElementwiseKernel`] into a compute pipeline. Compiled pipelines are kept
//! by the kernel cache in [`super::kernel`]; this module only builds and runs
//! them.
//!
//! If no adapter or device can be acquired the context stays empty and every
//! kernel runs on the host instead.

use super::kernel::ElementwiseKernel;
use crate::tensors::{Ten32, TensorFloat};
use briny::prelude::*;
use thiserror::Error;
use tracing::{info, warn};
use wgpu::util::DeviceExt;

const WORKGROUP_SIZE: u32 = 64;

/// Basic wrapper for common GPU errors.
#[derive(Debug, Error)]
pub enum GpuError {
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// A failure while compiling or running a kernel on the GPU.
#[derive(Debug, Error)]
pub enum GpuFailure {
    /// The GPU itself could not be reached.
    #[error("GPU failure: {0}")]
    Gpu(#[from] GpuError),
    /// Generated shader source did not pass validation.
    #[error("GPU failure: shader rejected: {0}")]
    Validation(ValidationError),
    /// Anything else, described by a message.
    #[error("GPU failure: {0}")]
    Message(String),
}

impl From<ValidationError> for GpuFailure {
    fn from(kind: ValidationError) -> Self {
        Self::Validation(kind)
    }
}

impl From<&str> for GpuFailure {
    fn from(msg: &str) -> Self {
        Self::Message(msg.to_string())
    }
}

impl From<String> for GpuFailure {
    fn from(msg: String) -> Self {
        Self::Message(msg)
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
///
/// Initialized once globally and reused for all kernels.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Initializes a new GPU context, selecting the default adapter and creating a device + queue.
    ///
    /// # Errors
    /// [`GpuError`] if adapter or device acquisition fails.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("leaky_relu"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        info!(adapter = ?adapter.get_info().name, "GPU context ready");
        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            warn!(error = %err, "no GPU available, parallel kernels run on the host");
            None
        }
    };
}

/// Returns the shared GPU context, creating it on first call.
pub fn gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT.as_ref()
}

/// Secure wrapper for generated WGSL source code.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates `source` and compiles it into a labeled shader module.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), len) }
}

fn bytes_to_f32_slice(data: &[u8]) -> Result<&[f32], GpuFailure> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err("unaligned buffer".into());
    }

    if data.len() % size_of::<f32>() != 0 {
        return Err("buffer length is not a multiple of f32".into());
    }

    let len = data.len() / size_of::<f32>();
    unsafe { Ok(std::slice::from_raw_parts(data.as_ptr().cast::<f32>(), len)) }
}

/// An elementwise kernel compiled into a compute pipeline.
pub struct DeviceKernel {
    name: &'static str,
    inputs: usize,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl DeviceKernel {
    /// Compiles `kernel` for the shared GPU context.
    ///
    /// Returns `Ok(None)` when there is no GPU to compile for.
    ///
    /// # Errors
    /// - [`GpuFailure::Validation`] if the generated shader is rejected
    /// - [`GpuFailure::Message`] if the device fails to compile the shader or pipeline
    pub fn compile(kernel: &ElementwiseKernel) -> Result<Option<Self>, GpuFailure> {
        let Some(ctx) = gpu_context() else {
            return Ok(None);
        };
        let device = &ctx.device;

        // invalid WGSL is reported through the scope instead of the
        // uncaptured-error handler, which panics
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = match load_shader(device, kernel.name, &kernel.wgsl()) {
            Ok(module) => module,
            Err(err) => {
                let _ = pollster::block_on(device.pop_error_scope());
                return Err(err);
            }
        };

        let n = kernel.inputs.len() as u32;
        let entries: Vec<_> = (0..n)
            .map(|binding| storage_entry(binding, true))
            .chain([storage_entry(n, true), storage_entry(n + 1, false)])
            .collect();

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.name),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(format!("`{}` failed to compile: {err}", kernel.name).into());
        }

        Ok(Some(Self {
            name: kernel.name,
            inputs: kernel.inputs.len(),
            layout,
            pipeline,
        }))
    }

    /// Runs the pipeline, writing one result per element of `out`.
    ///
    /// # Errors
    /// [`GpuFailure`] if the dispatch is too large, polling fails or the
    /// staging buffer cannot be mapped.
    pub fn run(
        &self,
        out: &mut [f32],
        operands: &[&Ten32],
        scalars: &[TensorFloat],
    ) -> Result<(), GpuFailure> {
        let ctx = gpu_context().ok_or("GPU context unavailable")?;
        let (device, queue) = (&ctx.device, &ctx.queue);

        if operands.len() != self.inputs {
            return Err(format!("`{}` expects {} operands", self.name, self.inputs).into());
        }

        let len = u32::try_from(out.len()).map_err(|_| "tensor too large for the GPU")?;
        let workgroups = len.div_ceil(WORKGROUP_SIZE);
        if workgroups > device.limits().max_compute_workgroups_per_dimension {
            return Err("tensor too large for a single dispatch".into());
        }

        let input_bufs: Vec<wgpu::Buffer> = operands
            .iter()
            .map(|operand| {
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("operand"),
                    contents: as_bytes(&operand.data),
                    usage: wgpu::BufferUsages::STORAGE,
                })
            })
            .collect();

        // zero-sized bindings are invalid
        let scalar_data: &[f32] = if scalars.is_empty() { &[0.0] } else { scalars };
        let scalar_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scalars"),
            contents: as_bytes(scalar_data),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let size = std::mem::size_of_val(out) as u64;
        let output_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let entries: Vec<wgpu::BindGroupEntry> = input_bufs
            .iter()
            .chain([&scalar_buf, &output_buf])
            .enumerate()
            .map(|(binding, buf)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name),
            layout: &self.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.name),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        encoder.copy_buffer_to_buffer(&output_buf, 0, &staging, 0, size);
        queue.submit(Some(encoder.finish()));

        let (sender, receiver) = std::sync::mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| format!("device poll failed: {err}"))?;
        receiver
            .recv()
            .map_err(|_| "staging buffer was never mapped")?
            .map_err(|err| format!("staging buffer map failed: {err}"))?;

        let view = staging.slice(..).get_mapped_range();
        out.copy_from_slice(bytes_to_f32_slice(&view)?);
        drop(view);
        staging.unmap();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_shaders_pass_validation() {
        fn copy(values: &[TensorFloat], _: &[TensorFloat]) -> TensorFloat {
            values[0]
        }
        let kernel = ElementwiseKernel {
            name: "copy_test",
            inputs: &["x"],
            scalars: &[],
            operation: "x",
            host: copy,
        };
        assert!(WgslSource(&kernel.wgsl()).validate().is_ok());
    }

    fn copy_rule(values: &[TensorFloat], _: &[TensorFloat]) -> TensorFloat {
        values[0]
    }

    #[test]
    fn malformed_operations_fail_compilation_without_panicking() {
        if gpu_context().is_none() {
            return;
        }
        let broken = ElementwiseKernel {
            name: "broken_test",
            inputs: &["x"],
            scalars: &[],
            operation: "x +",
            host: copy_rule,
        };
        assert!(DeviceKernel::compile(&broken).is_err());
    }

    #[test]
    fn device_results_are_read_back() {
        if gpu_context().is_none() {
            return;
        }
        let kernel = ElementwiseKernel {
            name: "readback_test",
            inputs: &["x"],
            scalars: &[],
            operation: "x",
            host: copy_rule,
        };
        let device = DeviceKernel::compile(&kernel).unwrap().unwrap();
        let x = crate::tensors::Tensor::new(vec![130], (0..130).map(|i| i as f32).collect());
        let mut out = vec![0.0; 130];
        device.run(&mut out, &[&x], &[]).unwrap();
        assert_eq!(out, x.data);
    }

    #[test]
    fn unsafe_sources_are_rejected() {
        assert!(WgslSource("fn helper() {}").validate().is_err());
        assert!(WgslSource("#include \"x\"\nfn main() {}").validate().is_err());
        assert!(WgslSource("fn main() { let p: ptr<function, f32>; }").validate().is_err());
    }
}
