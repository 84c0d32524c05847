//! Procedural meshes uploaded straight to a [`GpuDevice`].

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::{IndexFormat, MeshGeometry, VertexLayout};
use crate::gpu::{GpuBuffer, GpuDevice};
use crate::util::Result;

/// Interleaved vertex matching [`VertexLayout::position_normal_uv`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Upload vertices and indices as a single-submesh geometry.
pub fn upload(
    device: &Arc<dyn GpuDevice>,
    name: &str,
    vertices: &[Vertex],
    indices: &[u32],
    index_format: IndexFormat,
) -> Result<MeshGeometry> {
    let vertex_buffer = GpuBuffer::with_data(
        device,
        &format!("{name}_vertices"),
        bytemuck::cast_slice(vertices),
        std::mem::size_of::<Vertex>(),
    )?;

    let index_buffer = match index_format {
        IndexFormat::U16 => {
            let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
            GpuBuffer::with_data(device, &format!("{name}_indices"), bytemuck::cast_slice(&narrow), 2)?
        }
        IndexFormat::U32 => {
            GpuBuffer::with_data(device, &format!("{name}_indices"), bytemuck::cast_slice(indices), 4)?
        }
    };

    Ok(MeshGeometry {
        vertex_buffer,
        index_buffer,
        layout: VertexLayout::position_normal_uv(),
        index_format,
        submesh_index_counts: vec![indices.len() as u32],
    })
}

/// Axis-aligned cube of the given half extent centred on the origin, 12 triangles.
pub fn cube(device: &Arc<dyn GpuDevice>, half_extent: f32, index_format: IndexFormat) -> Result<MeshGeometry> {
    let (vertices, indices) = cube_data(half_extent);
    upload(device, "cube", &vertices, &indices, index_format)
}

/// `count` disjoint unit triangles laid out along +X, facing +Z.
pub fn triangle_row(device: &Arc<dyn GpuDevice>, count: usize, index_format: IndexFormat) -> Result<MeshGeometry> {
    let (vertices, indices) = triangle_row_data(count);
    upload(device, "triangle_row", &vertices, &indices, index_format)
}

pub fn cube_data(half_extent: f32) -> (Vec<Vertex>, Vec<u32>) {
    // (normal, tangent u, tangent v) per face
    let faces = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (n, u, v) in faces {
        let base = vertices.len() as u32;
        for (cu, cv) in corners {
            let position = [
                (n[0] + u[0] * cu + v[0] * cv) * half_extent,
                (n[1] + u[1] * cu + v[1] * cv) * half_extent,
                (n[2] + u[2] * cu + v[2] * cv) * half_extent,
            ];
            vertices.push(Vertex {
                position,
                normal: n,
                uv: [(cu + 1.0) * 0.5, (cv + 1.0) * 0.5],
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

pub fn triangle_row_data(count: usize) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::with_capacity(count * 3);
    for i in 0..count {
        let x = i as f32 * 1.5;
        let normal = [0.0, 0.0, 1.0];
        vertices.push(Vertex { position: [x, 0.0, 0.0], normal, uv: [0.0, 0.0] });
        vertices.push(Vertex { position: [x + 1.0, 0.0, 0.0], normal, uv: [1.0, 0.0] });
        vertices.push(Vertex { position: [x, 1.0, 0.0], normal, uv: [0.0, 1.0] });
    }
    let indices = (0..(count * 3) as u32).collect();
    (vertices, indices)
}
