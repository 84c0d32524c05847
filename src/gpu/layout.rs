//! Fixed GPU element layouts shared with the ray tracing shaders.
//!
//! Pool buffers are always sized as an exact multiple of these strides.

use bytemuck::{Pod, Zeroable};

use crate::util::Mat4;

/// One packed vertex position (vec4).
pub const VERTEX_POSITION_STRIDE: usize = 16;
/// Per-triangle shading attributes.
pub const TRIANGLE_ATTRIBUTE_STRIDE: usize = 60;
/// Compressed BLAS node.
pub const BLAS_NODE_STRIDE: usize = 80;
/// Compressed BLAS triangle record (one vertex, three per triangle).
pub const BLAS_TRI_STRIDE: usize = 16;
/// TLAS node.
pub const TLAS_NODE_STRIDE: usize = 64;
/// TLAS instance index.
pub const TLAS_INDEX_STRIDE: usize = 4;
/// Instance table record.
pub const BLAS_INSTANCE_STRIDE: usize = 76;

/// Per-triangle normals and UVs, written by the extraction kernel (60 bytes).
///
/// Indexed like the vertex arena divided by three. Only the renderer reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct TriangleAttributes {
    pub n0: [f32; 3],
    pub n1: [f32; 3],
    pub n2: [f32; 3],
    pub uv0: [f32; 2],
    pub uv1: [f32; 2],
    pub uv2: [f32; 2],
}

/// Instance table record (76 bytes, matches the WGSL `BlasInstance` struct).
///
/// Offsets are element offsets into the shared node and triangle pools.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlasInstance {
    /// World-to-object transform, column-major.
    pub inv_transform: [[f32; 4]; 4],
    pub bvh_node_offset: u32,
    pub bvh_tri_offset: u32,
    /// First triangle of the mesh in the global vertex arena.
    pub tri_offset: u32,
}

impl BlasInstance {
    pub fn new(local_to_world: &Mat4, bvh_node_offset: u32, bvh_tri_offset: u32, tri_offset: u32) -> Self {
        Self {
            inv_transform: local_to_world.inverse().to_cols_array_2d(),
            bvh_node_offset,
            bvh_tri_offset,
            tri_offset,
        }
    }
}

const _: () = assert!(std::mem::size_of::<TriangleAttributes>() == TRIANGLE_ATTRIBUTE_STRIDE);
const _: () = assert!(std::mem::size_of::<BlasInstance>() == BLAS_INSTANCE_STRIDE);
const _: () = assert!(std::mem::size_of::<glam::Vec4>() == VERTEX_POSITION_STRIDE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Vec3;

    #[test]
    fn test_instance_inverse_transform() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let inst = BlasInstance::new(&m, 5, 6, 7);
        let inv = Mat4::from_cols_array_2d(&inst.inv_transform);
        let p = inv.transform_point3(Vec3::new(1.0, 2.0, 3.0));
        assert!(p.length() < 1e-6);
        assert_eq!((inst.bvh_node_offset, inst.bvh_tri_offset, inst.tri_offset), (5, 6, 7));
    }

    #[test]
    fn test_instance_bytes() {
        let inst = BlasInstance::new(&Mat4::IDENTITY, 1, 2, 3);
        let bytes = bytemuck::bytes_of(&inst);
        assert_eq!(bytes.len(), BLAS_INSTANCE_STRIDE);
        assert_eq!(&bytes[64..68], &1u32.to_le_bytes());
        assert_eq!(&bytes[72..76], &3u32.to_le_bytes());
    }
}
