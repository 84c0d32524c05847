//! Vertex extraction: repack a mesh into the canonical arena layout.
//!
//! One job per mesh, one invocation per triangle. Each invocation reads the
//! three indexed vertices from the source buffers and writes
//! - three `vec4` positions (w = 1) at `3 * (output_triangle_start + tri)`
//! - one [`TriangleAttributes`] record at `output_triangle_start + tri`
//!
//! [`extract_mesh`] is the CPU reference kernel. `mesh_processing.wgsl` is the
//! GPU version and must stay in sync with it.

use rayon::prelude::*;

use super::layout::TriangleAttributes;
use super::BufferId;
use crate::scene::{IndexFormat, VertexAttribute, VertexFormat, VertexLayout};
use crate::util::{Error, Result, Vec3, Vec4};

/// Byte locations of the attributes the kernel consumes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PackedLayout {
    /// Bytes per source vertex.
    pub stride: u32,
    pub position_offset: u32,
    /// `None` if the mesh has no usable normals (face normals are generated).
    pub normal_offset: Option<u32>,
    /// `None` if the mesh has no usable texture coordinates (zero UVs).
    pub uv_offset: Option<u32>,
}

impl PackedLayout {
    /// Locate position, normal and UV0 within `layout`.
    ///
    /// Positions must be 32-bit float with at least three components. Normals
    /// and UVs in any other format are treated as absent.
    pub fn resolve(layout: &VertexLayout) -> Result<Self> {
        let position = layout
            .find(VertexAttribute::Position)
            .ok_or_else(|| Error::UnsupportedLayout("no position attribute".into()))?;
        if position.format != VertexFormat::Float32 || position.dimension < 3 {
            return Err(Error::UnsupportedLayout(format!(
                "position must be Float32x3, got {:?}x{}",
                position.format, position.dimension
            )));
        }

        let float_attr = |attribute, dimension| {
            layout
                .find(attribute)
                .filter(|l| l.format == VertexFormat::Float32 && l.dimension >= dimension)
                .map(|l| l.offset as u32)
        };

        Ok(Self {
            stride: layout.stride() as u32,
            position_offset: position.offset as u32,
            normal_offset: float_attr(VertexAttribute::Normal, 3),
            uv_offset: float_attr(VertexAttribute::TexCoord0, 2),
        })
    }
}

/// Parameters of one extraction dispatch.
#[derive(Clone, Copy, Debug)]
pub struct ExtractionJob {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    /// Explicit per-dispatch index width.
    pub index_format: IndexFormat,
    pub layout: PackedLayout,
    pub triangle_count: u32,
    /// First destination triangle in the arena.
    pub output_triangle_start: u32,
    /// Destination position arena (16-byte elements).
    pub positions: BufferId,
    /// Destination triangle attribute buffer (60-byte elements).
    pub attributes: BufferId,
}

impl ExtractionJob {
    /// Number of workgroups needed to cover every triangle.
    pub fn workgroup_count(&self, workgroup_size: u32) -> u32 {
        self.triangle_count.div_ceil(workgroup_size.max(1))
    }
}

/// Fetch a little-endian u32 at a byte offset; out-of-range reads give 0.
#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

#[inline]
fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(bytes, offset))
}

#[inline]
fn read_index(bytes: &[u8], format: IndexFormat, i: usize) -> usize {
    match format {
        IndexFormat::U16 => bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .unwrap_or(0),
        IndexFormat::U32 => read_u32(bytes, i * 4) as usize,
    }
}

/// Run the extraction kernel on host memory.
///
/// Returns `3 * triangle_count` positions and `triangle_count` attribute
/// records, ready to be written at the job's destination offset.
pub fn extract_mesh(
    vertex_bytes: &[u8],
    index_bytes: &[u8],
    job: &ExtractionJob,
) -> (Vec<Vec4>, Vec<TriangleAttributes>) {
    let layout = job.layout;
    let stride = layout.stride as usize;

    let vec3_at = |vertex: usize, offset: u32| {
        let base = vertex * stride + offset as usize;
        Vec3::new(
            read_f32(vertex_bytes, base),
            read_f32(vertex_bytes, base + 4),
            read_f32(vertex_bytes, base + 8),
        )
    };
    let vec2_at = |vertex: usize, offset: u32| {
        let base = vertex * stride + offset as usize;
        [read_f32(vertex_bytes, base), read_f32(vertex_bytes, base + 4)]
    };

    let per_triangle: Vec<([Vec4; 3], TriangleAttributes)> = (0..job.triangle_count as usize)
        .into_par_iter()
        .map(|tri| {
            let idx = [0, 1, 2].map(|k| read_index(index_bytes, job.index_format, tri * 3 + k));
            let p = idx.map(|v| vec3_at(v, layout.position_offset));

            let n = match layout.normal_offset {
                Some(offset) => idx.map(|v| vec3_at(v, offset).to_array()),
                None => {
                    let face = (p[1] - p[0]).cross(p[2] - p[0]).normalize_or_zero();
                    [face.to_array(); 3]
                }
            };
            let uv = match layout.uv_offset {
                Some(offset) => idx.map(|v| vec2_at(v, offset)),
                None => [[0.0; 2]; 3],
            };

            (
                p.map(|v| v.extend(1.0)),
                TriangleAttributes {
                    n0: n[0],
                    n1: n[1],
                    n2: n[2],
                    uv0: uv[0],
                    uv1: uv[1],
                    uv2: uv[2],
                },
            )
        })
        .collect();

    let mut positions = Vec::with_capacity(per_triangle.len() * 3);
    let mut attributes = Vec::with_capacity(per_triangle.len());
    for (verts, attrs) in per_triangle {
        positions.extend_from_slice(&verts);
        attributes.push(attrs);
    }
    (positions, attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::shapes::triangle_row_data;
    use crate::scene::VertexAttributeDescriptor;

    fn job(layout: PackedLayout, index_format: IndexFormat, triangle_count: u32) -> ExtractionJob {
        ExtractionJob {
            vertex_buffer: BufferId(0),
            index_buffer: BufferId(1),
            index_format,
            layout,
            triangle_count,
            output_triangle_start: 0,
            positions: BufferId(2),
            attributes: BufferId(3),
        }
    }

    #[test]
    fn test_resolve_standard_layout() {
        let packed = PackedLayout::resolve(&VertexLayout::position_normal_uv()).unwrap();
        assert_eq!(packed.stride, 32);
        assert_eq!(packed.position_offset, 0);
        assert_eq!(packed.normal_offset, Some(12));
        assert_eq!(packed.uv_offset, Some(24));
    }

    #[test]
    fn test_resolve_rejects_half_positions() {
        let layout = VertexLayout::new(vec![VertexAttributeDescriptor::new(
            VertexAttribute::Position,
            VertexFormat::Float16,
            4,
        )]);
        assert!(matches!(PackedLayout::resolve(&layout), Err(Error::UnsupportedLayout(_))));
        assert!(PackedLayout::resolve(&VertexLayout::default()).is_err());
    }

    #[test]
    fn test_resolve_ignores_packed_normals() {
        let layout = VertexLayout::new(vec![
            VertexAttributeDescriptor::new(VertexAttribute::Normal, VertexFormat::SNorm8, 4),
            VertexAttributeDescriptor::new(VertexAttribute::Position, VertexFormat::Float32, 3),
        ]);
        let packed = PackedLayout::resolve(&layout).unwrap();
        assert_eq!(packed.position_offset, 4);
        assert_eq!(packed.normal_offset, None);
        assert_eq!(packed.uv_offset, None);
    }

    #[test]
    fn test_extract_u16_and_u32_agree() {
        let (vertices, indices) = triangle_row_data(4);
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
        let layout = PackedLayout::resolve(&VertexLayout::position_normal_uv()).unwrap();

        let (p32, a32) = extract_mesh(vertex_bytes, bytemuck::cast_slice(&indices), &job(layout, IndexFormat::U32, 4));
        let (p16, a16) = extract_mesh(vertex_bytes, bytemuck::cast_slice(&narrow), &job(layout, IndexFormat::U16, 4));
        assert_eq!(p32, p16);
        assert_eq!(a32, a16);

        assert_eq!(p32.len(), 12);
        assert_eq!(p32[3], Vec4::new(1.5, 0.0, 0.0, 1.0));
        assert_eq!(a32[1].uv1, [1.0, 0.0]);
        assert_eq!(a32[1].n0, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_extract_generates_face_normals() {
        let (vertices, indices) = triangle_row_data(1);
        let positions_only: Vec<[f32; 3]> = vertices.iter().map(|v| v.position).collect();
        let layout = PackedLayout {
            stride: 12,
            position_offset: 0,
            normal_offset: None,
            uv_offset: None,
        };
        let (_, attrs) = extract_mesh(
            bytemuck::cast_slice(&positions_only),
            bytemuck::cast_slice(&indices),
            &job(layout, IndexFormat::U32, 1),
        );
        assert_eq!(attrs[0].n2, [0.0, 0.0, 1.0]);
        assert_eq!(attrs[0].uv0, [0.0, 0.0]);
    }

    #[test]
    fn test_workgroup_count() {
        let layout = PackedLayout::resolve(&VertexLayout::position_normal_uv()).unwrap();
        assert_eq!(job(layout, IndexFormat::U32, 64).workgroup_count(64), 1);
        assert_eq!(job(layout, IndexFormat::U32, 65).workgroup_count(64), 2);
        assert_eq!(job(layout, IndexFormat::U32, 0).workgroup_count(64), 0);
    }
}
