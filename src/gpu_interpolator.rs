use std::borrow::Cow;
use std::fmt;

use futures::channel::oneshot;
use tracing::{debug, info, warn};
use wgpu::{PollType, util::DeviceExt};

use crate::enums::Processor;
use crate::interpolator::{Interpolator, check_buffers};
use crate::resampler::ResampleError;

const PREFILTER_WORKGROUP_SIZE: u32 = 8;
const RESAMPLE_WORKGROUP_SIZE: u32 = 4;

pub struct WGPU {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    // w: prefilter axis
    src: [u32; 4],
    dst: [u32; 4],
}

/// Cubic B-spline resampling in a `wgpu` compute shader.
///
/// Each call to [`Interpolator::interpolate`] uploads the volume, runs the
/// optional prefilter passes and the resample pass, and blocks until the
/// result has been copied back. All GPU buffers are created for that call
/// and released when it returns, whether it succeeded or not.
pub struct GpuInterpolator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    prefilter_pipeline: wgpu::ComputePipeline,
    resample_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    adapter_name: Option<String>,
}

impl GpuInterpolator {
    /// Request a hardware adapter and build the resampling pipelines on it.
    ///
    /// Software (CPU) adapters are refused: resampling on them would be
    /// slower than [`crate::interpolator::CpuInterpolator`].
    pub async fn new() -> Result<Self, ResampleError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|err| unavailable(err.to_string()))?;

        let info = adapter.get_info();
        if info.device_type == wgpu::DeviceType::Cpu {
            return Err(unavailable(format!(
                "only a software adapter is present ({})",
                info.name
            )));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Resample Device"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|err| unavailable(err.to_string()))?;

        let mut interpolator = Self::from_wgpu(WGPU { device, queue });
        interpolator.adapter_name = Some(format!("{} ({:?})", info.name, info.backend));
        Ok(interpolator)
    }

    /// Build the resampling pipelines on an existing device.
    pub fn from_wgpu(wgpu: WGPU) -> Self {
        let WGPU { device, queue } = wgpu;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Resample Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/resample.wgsl"))),
        });

        let storage_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Resample Bind Group Layout"),
            entries: &[
                // Input samples, prefiltered in place into coefficients
                storage_entry(0),
                // Resampled output
                storage_entry(1),
                // Params
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Resample Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = |label: &str, entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let prefilter_pipeline = pipeline("Prefilter Pipeline", "prefilter");
        let resample_pipeline = pipeline("Resample Pipeline", "resample");

        Self {
            device,
            queue,
            prefilter_pipeline,
            resample_pipeline,
            bind_group_layout,
            adapter_name: None,
        }
    }

    pub fn adapter_name(&self) -> Option<&str> {
        self.adapter_name.as_deref()
    }

    fn check_limits(&self, src: [usize; 3], dst: [usize; 3]) -> Result<(), ResampleError> {
        let limits = self.device.limits();
        let binding_limit = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        for dims in [src, dst] {
            let bytes = (dims.iter().product::<usize>() * size_of::<f32>()) as u64;
            if bytes > binding_limit {
                return Err(ResampleError::DeviceLimit {
                    what: "storage buffer bytes",
                    required: bytes,
                    limit: binding_limit,
                });
            }
        }

        let max_groups = u64::from(limits.max_compute_workgroups_per_dimension);
        let prefilter_groups = src
            .iter()
            .map(|&n| (n as u64).div_ceil(u64::from(PREFILTER_WORKGROUP_SIZE)))
            .max()
            .unwrap_or(0);
        let resample_groups = dst
            .iter()
            .map(|&n| (n as u64).div_ceil(u64::from(RESAMPLE_WORKGROUP_SIZE)))
            .max()
            .unwrap_or(0);
        let groups = prefilter_groups.max(resample_groups);
        if groups > max_groups {
            return Err(ResampleError::DeviceLimit {
                what: "workgroups per dimension",
                required: groups,
                limit: max_groups,
            });
        }
        Ok(())
    }

    fn params_bind_group(&self, params: Params, input: &wgpu::Buffer, output: &wgpu::Buffer) -> wgpu::BindGroup {
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Resample Params Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Resample Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        })
    }

    fn run(
        &self,
        input: &[f32],
        output: &mut [f32],
        src: [u32; 3],
        dst: [u32; 3],
        prefilter: bool,
    ) -> Result<(), ResampleError> {
        let output_size = std::mem::size_of_val(output) as u64;

        let input_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Resample Input Buffer"),
                contents: bytemuck::cast_slice(input),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Resample Output Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Resample Staging Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_groups: Vec<wgpu::BindGroup> = (0..3)
            .map(|axis| {
                let params = Params {
                    src: [src[0], src[1], src[2], axis],
                    dst: [dst[0], dst[1], dst[2], 0],
                };
                self.params_bind_group(params, &input_buffer, &output_buffer)
            })
            .collect();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Resample Encoder"),
            });
        if prefilter {
            for (axis, bind_group) in bind_groups.iter().enumerate() {
                if src[axis] < 2 {
                    continue;
                }
                // Lines along `axis` are addressed by the two remaining axes.
                let (u, v) = match axis {
                    0 => (src[1], src[2]),
                    1 => (src[0], src[2]),
                    _ => (src[0], src[1]),
                };
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Prefilter Pass"),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&self.prefilter_pipeline);
                compute_pass.set_bind_group(0, bind_group, &[]);
                compute_pass.dispatch_workgroups(
                    u.div_ceil(PREFILTER_WORKGROUP_SIZE),
                    v.div_ceil(PREFILTER_WORKGROUP_SIZE),
                    1,
                );
            }
        }
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Resample Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.resample_pipeline);
            compute_pass.set_bind_group(0, &bind_groups[0], &[]);
            compute_pass.dispatch_workgroups(
                dst[0].div_ceil(RESAMPLE_WORKGROUP_SIZE),
                dst[1].div_ceil(RESAMPLE_WORKGROUP_SIZE),
                dst[2].div_ceil(RESAMPLE_WORKGROUP_SIZE),
            );
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| ResampleError::Device(err.to_string()))?;
        futures::executor::block_on(receiver)
            .map_err(|_| ResampleError::Device("buffer mapping was cancelled".to_string()))?
            .map_err(|err| ResampleError::Device(err.to_string()))?;

        {
            let data = buffer_slice.get_mapped_range();
            let values: &[f32] = bytemuck::cast_slice::<u8, f32>(&data);
            if values.len() != output.len() {
                return Err(ResampleError::ShapeMismatch {
                    expected: output.len(),
                    actual: values.len(),
                });
            }
            output.copy_from_slice(values);
        }
        staging_buffer.unmap();
        Ok(())
    }
}

impl Interpolator for GpuInterpolator {
    fn processor(&self) -> Processor {
        Processor::GPU
    }

    fn interpolate(
        &self,
        input: &[f32],
        output: &mut [f32],
        src: [usize; 3],
        dst: [usize; 3],
        prefilter: bool,
    ) -> Result<(), ResampleError> {
        check_buffers(input, output, src, dst)?;
        self.check_limits(src, dst)?;
        // Both sizes fit a u32 once their byte counts passed the binding limit.
        let src = src.map(|n| n as u32);
        let dst = dst.map(|n| n as u32);
        debug!(?src, ?dst, prefilter, "dispatching GPU resample");

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = self.run(input, output, src, dst, prefilter);
        let validation = futures::executor::block_on(self.device.pop_error_scope());
        let out_of_memory = futures::executor::block_on(self.device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(ResampleError::Device(err.to_string()));
        }
        result
    }
}

fn unavailable(reason: String) -> ResampleError {
    ResampleError::BackendUnavailable {
        processor: Processor::GPU,
        reason,
    }
}

/// Whether a GPU interpolator can be used, decided once by the caller.
pub enum AcceleratorAvailability {
    Available(Box<dyn Interpolator>),
    Unavailable,
}

impl AcceleratorAvailability {
    /// Look for a hardware adapter and build a [`GpuInterpolator`] on it.
    pub async fn probe() -> Self {
        match GpuInterpolator::new().await {
            Ok(gpu) => {
                info!(adapter = gpu.adapter_name().unwrap_or("unknown"), "GPU resampling available");
                AcceleratorAvailability::Available(Box::new(gpu))
            }
            Err(err) => {
                warn!(%err, "GPU resampling unavailable");
                AcceleratorAvailability::Unavailable
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, AcceleratorAvailability::Available(_))
    }

    pub fn interpolator(&self) -> Option<&dyn Interpolator> {
        match self {
            AcceleratorAvailability::Available(interpolator) => Some(interpolator.as_ref()),
            AcceleratorAvailability::Unavailable => None,
        }
    }
}

impl From<GpuInterpolator> for AcceleratorAvailability {
    fn from(gpu: GpuInterpolator) -> Self {
        AcceleratorAvailability::Available(Box::new(gpu))
    }
}

impl fmt::Debug for AcceleratorAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorAvailability::Available(interpolator) => f
                .debug_tuple("Available")
                .field(&interpolator.processor())
                .finish(),
            AcceleratorAvailability::Unavailable => f.write_str("Unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolator::CpuInterpolator;

    #[test]
    fn params_match_the_uniform_layout() {
        assert_eq!(size_of::<Params>(), 32);
    }

    #[test]
    fn availability_reports_its_state() {
        let unavailable = AcceleratorAvailability::Unavailable;
        assert!(!unavailable.is_available());
        assert!(unavailable.interpolator().is_none());

        let available = AcceleratorAvailability::Available(Box::new(CpuInterpolator::default()));
        assert!(available.is_available());
        assert_eq!(format!("{available:?}"), "Available(CPU)");
    }

    /// Pipelines on whatever adapter is present, software ones included.
    async fn any_adapter_interpolator() -> Option<GpuInterpolator> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok()?;
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return None;
        }
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Test Device"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .ok()?;
        Some(GpuInterpolator::from_wgpu(WGPU { device, queue }))
    }

    fn ramp(src: [usize; 3]) -> Vec<f32> {
        (0..src.iter().product::<usize>())
            .map(|i| {
                let x = (i % src[0]) as f32;
                let y = ((i / src[0]) % src[1]) as f32;
                let z = (i / (src[0] * src[1])) as f32;
                x + 10.0 * y + 100.0 * z + (x * 0.3).sin() * 4.0
            })
            .collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shader_matches_cpu_reference() {
        let Some(gpu) = any_adapter_interpolator().await else {
            eprintln!("skipping: no adapter with compute shaders");
            return;
        };

        let cases = [
            ([4, 1, 1], [4, 1, 1]),
            ([24, 18, 12], [12, 7, 9]),
            ([5, 4, 3], [11, 9, 7]),
        ];
        for (src, dst) in cases {
            let input = ramp(src);
            for prefilter in [true, false] {
                let mut expected = vec![0.0; dst.iter().product()];
                CpuInterpolator::default()
                    .interpolate(&input, &mut expected, src, dst, prefilter)
                    .unwrap();
                let mut actual = vec![0.0; expected.len()];
                gpu.interpolate(&input, &mut actual, src, dst, prefilter).unwrap();

                for (i, (a, e)) in actual.iter().zip(&expected).enumerate() {
                    assert!(
                        (a - e).abs() <= 1e-2 + 1e-5 * e.abs(),
                        "{src:?} -> {dst:?}, prefilter {prefilter}, voxel {i}: {a} vs {e}"
                    );
                }
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hardware_probe_never_fails_hard() {
        match GpuInterpolator::new().await {
            Ok(gpu) => assert!(gpu.adapter_name().is_some()),
            Err(err) => assert!(matches!(err, ResampleError::BackendUnavailable { .. })),
        }
    }
}
