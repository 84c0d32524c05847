//! [`GpuDevice`] over a host-supplied wgpu device and queue.
//!
//! Every pipeline buffer is a storage buffer that can also be copied to and
//! from. Extraction runs `mesh_processing.wgsl`; readback copies into a
//! `MAP_READ` staging buffer and maps it asynchronously. Completed maps are
//! collected by the map callback and handed to the caller from [`GpuDevice::poll`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{BufferDesc, BufferId, ExtractionJob, GpuDevice, ReadbackCallback};
use crate::scene::IndexFormat;
use crate::util::{Error, Result};

const MESH_PROCESSING_WGSL: &str = include_str!("mesh_processing.wgsl");

/// Matches the WGSL `Params` struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ExtractParams {
    vertex_stride: u32,
    position_offset: u32,
    normal_offset: u32,
    uv_offset: u32,
    triangle_count: u32,
    output_start: u32,
    index_u16: u32,
    flags: u32,
}

const FLAG_NORMALS: u32 = 1;
const FLAG_UVS: u32 = 2;

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    /// Requested size; the allocation is rounded up to the copy alignment.
    size: u64,
}

struct InFlight {
    staging: wgpu::Buffer,
    size: u64,
    callback: ReadbackCallback,
}

/// wgpu-backed device.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    workgroup_size: u32,
    buffers: Mutex<HashMap<u32, DeviceBuffer>>,
    next_id: AtomicU32,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    next_ticket: AtomicU64,
    /// Tickets whose map callback fired, with the map outcome.
    mapped: Arc<Mutex<Vec<(u64, std::result::Result<(), wgpu::BufferAsyncError>)>>>,
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

/// Round up to a non-zero multiple of `COPY_BUFFER_ALIGNMENT`.
fn aligned_size(size: u64) -> u64 {
    size.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, workgroup_size: u32) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("mesh_processing_shader"),
            source: wgpu::ShaderSource::Wgsl(MESH_PROCESSING_WGSL.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("mesh_processing_bgl"),
            entries: &[
                // @binding(0) source vertices
                storage_entry(0, true),
                // @binding(1) source indices
                storage_entry(1, true),
                // @binding(2) position arena
                storage_entry(2, false),
                // @binding(3) triangle attributes
                storage_entry(3, false),
                // @binding(4) params
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
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
            label: Some("mesh_processing_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let workgroup_size = workgroup_size.clamp(1, 256);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("mesh_processing_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &[("WORKGROUP_SIZE", workgroup_size as f64)],
                ..Default::default()
            },
            cache: None,
        });

        Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            workgroup_size,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            mapped: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Underlying wgpu buffer, for binding by the renderer.
    pub fn buffer(&self, id: BufferId) -> Option<wgpu::Buffer> {
        self.buffers.lock().get(&id.0).map(|b| b.buffer.clone())
    }
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferId> {
        let size = desc.size_bytes();
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: aligned_size(size),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(id, DeviceBuffer { buffer, size });
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, id: BufferId) {
        if let Some(b) = self.buffers.lock().remove(&id.0) {
            b.buffer.destroy();
        }
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let target = buffers.get(&id.0).ok_or(Error::UnknownBuffer(id))?;
        if offset + data.len() as u64 > target.size || offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::WriteOutOfRange {
                offset,
                len: data.len(),
                size: target.size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&target.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned_size(data.len() as u64) as usize, 0);
            self.queue.write_buffer(&target.buffer, offset, &padded);
        }
        Ok(())
    }

    fn dispatch_extraction(&self, job: &ExtractionJob) -> Result<()> {
        if job.triangle_count == 0 {
            return Ok(());
        }
        let buffers = self.buffers.lock();
        let get = |id: BufferId| buffers.get(&id.0).map(|b| &b.buffer).ok_or(Error::UnknownBuffer(id));
        let vertices = get(job.vertex_buffer)?;
        let indices = get(job.index_buffer)?;
        let positions = get(job.positions)?;
        let attributes = get(job.attributes)?;

        let layout = job.layout;
        let params = ExtractParams {
            vertex_stride: layout.stride,
            position_offset: layout.position_offset,
            normal_offset: layout.normal_offset.unwrap_or(0),
            uv_offset: layout.uv_offset.unwrap_or(0),
            triangle_count: job.triangle_count,
            output_start: job.output_triangle_start,
            index_u16: u32::from(job.index_format == IndexFormat::U16),
            flags: (if layout.normal_offset.is_some() { FLAG_NORMALS } else { 0 })
                | (if layout.uv_offset.is_some() { FLAG_UVS } else { 0 }),
        };
        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mesh_processing_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mesh_processing_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: vertices.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: indices.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: positions.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: attributes.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: params_buffer.as_entire_binding() },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mesh_processing_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("mesh_processing_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(job.workgroup_count(self.workgroup_size), 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn request_readback(&self, id: BufferId, on_complete: ReadbackCallback) -> Result<()> {
        let buffers = self.buffers.lock();
        let source = buffers.get(&id.0).ok_or(Error::UnknownBuffer(id))?;
        let copy_size = source.buffer.size();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: copy_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, copy_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().insert(
            ticket,
            InFlight {
                staging: staging.clone(),
                size: source.size,
                callback: on_complete,
            },
        );

        let mapped = Arc::clone(&self.mapped);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| mapped.lock().push((ticket, result)));
        Ok(())
    }

    fn poll(&self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!("wgpu poll failed: {e}");
        }

        let ready: Vec<_> = std::mem::take(&mut *self.mapped.lock());
        for (ticket, result) in ready {
            let Some(flight) = self.in_flight.lock().remove(&ticket) else {
                continue;
            };
            let data = match result {
                Ok(()) => {
                    let bytes = {
                        let view = flight.staging.slice(..).get_mapped_range();
                        view[..flight.size as usize].to_vec()
                    };
                    flight.staging.unmap();
                    Ok(bytes)
                }
                Err(e) => Err(Error::ReadbackFailed(e.to_string())),
            };
            flight.staging.destroy();
            (flight.callback)(data);
        }
    }
}
