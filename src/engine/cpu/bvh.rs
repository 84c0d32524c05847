//! GPU-facing node and triangle records exported by [`CpuEngine`](super::CpuEngine).

use bytemuck::{Pod, Zeroable};

use super::build::Bvh;
use crate::gpu::{BLAS_NODE_STRIDE, BLAS_TRI_STRIDE, TLAS_INDEX_STRIDE, TLAS_NODE_STRIDE};
use crate::util::{Aabb, Vec3, Vec4};

/// Compressed BLAS node (80 bytes).
///
/// Carries its own bounds plus both child bounds so a traversal step tests
/// the two children without fetching them. Internal: `left_or_first` is the
/// left child, the right child follows it. Leaf: `count` > 0 and
/// `left_or_first` is the first triangle record divided by three.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlasNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
    pub left_min: [f32; 3],
    pub left_max: [f32; 3],
    pub right_min: [f32; 3],
    pub right_max: [f32; 3],
}

/// One triangle vertex (16 bytes). `prim` is the source triangle index
/// within the mesh, stored in the w lane.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlasVertex {
    pub position: [f32; 3],
    pub prim: u32,
}

/// TLAS node (64 bytes), two children per node.
///
/// Internal: `left`/`right` are child node indices, `tri_count` = 0.
/// Leaf: `first_tri` indexes the instance index array, `tri_count` > 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasNode {
    pub lmin: [f32; 3],
    pub left: u32,
    pub lmax: [f32; 3],
    pub right: u32,
    pub rmin: [f32; 3],
    pub tri_count: u32,
    pub rmax: [f32; 3],
    pub first_tri: u32,
}

const _: () = assert!(std::mem::size_of::<BlasNode>() == BLAS_NODE_STRIDE);
const _: () = assert!(std::mem::size_of::<BlasVertex>() == BLAS_TRI_STRIDE);
const _: () = assert!(std::mem::size_of::<TlasNode>() == TLAS_NODE_STRIDE);
const _: () = assert!(std::mem::size_of::<u32>() == TLAS_INDEX_STRIDE);

fn bounds_arrays(b: &Aabb) -> ([f32; 3], [f32; 3]) {
    if b.is_empty() {
        ([0.0; 3], [0.0; 3])
    } else {
        (b.min.to_array(), b.max.to_array())
    }
}

/// Export a BLAS: nodes with inlined child bounds, and triangle vertices in leaf order.
///
/// `triangles` holds three object-space positions per source triangle.
pub fn compress_blas(bvh: &Bvh, triangles: &[Vec3]) -> (Vec<BlasNode>, Vec<BlasVertex>) {
    let nodes = bvh
        .nodes
        .iter()
        .map(|node| {
            let (aabb_min, aabb_max) = bounds_arrays(&node.bounds);
            let mut out = BlasNode {
                aabb_min,
                left_or_first: node.left_or_first,
                aabb_max,
                count: node.count,
                left_min: [0.0; 3],
                left_max: [0.0; 3],
                right_min: [0.0; 3],
                right_max: [0.0; 3],
            };
            if !node.is_leaf() && bvh.nodes.len() > 1 {
                let left = node.left_or_first as usize;
                (out.left_min, out.left_max) = bounds_arrays(&bvh.nodes[left].bounds);
                (out.right_min, out.right_max) = bounds_arrays(&bvh.nodes[left + 1].bounds);
            }
            out
        })
        .collect();

    let vertices = bvh
        .prim_indices
        .iter()
        .flat_map(|&prim| {
            let base = prim as usize * 3;
            (0..3).map(move |k| BlasVertex {
                position: triangles[base + k].to_array(),
                prim,
            })
        })
        .collect();

    (nodes, vertices)
}

/// Export a TLAS as two-child nodes plus the reordered instance indices.
pub fn compress_tlas(bvh: &Bvh) -> (Vec<TlasNode>, Vec<u32>) {
    let child = |index: usize| bounds_arrays(&bvh.nodes[index].bounds);

    let nodes = bvh
        .nodes
        .iter()
        .map(|node| {
            if node.is_leaf() || bvh.nodes.len() == 1 {
                let (lmin, lmax) = bounds_arrays(&node.bounds);
                TlasNode {
                    lmin,
                    left: 0,
                    lmax,
                    right: 0,
                    rmin: [0.0; 3],
                    tri_count: node.count,
                    rmax: [0.0; 3],
                    first_tri: node.left_or_first,
                }
            } else {
                let left = node.left_or_first as usize;
                let (lmin, lmax) = child(left);
                let (rmin, rmax) = child(left + 1);
                TlasNode {
                    lmin,
                    left: left as u32,
                    lmax,
                    right: left as u32 + 1,
                    rmin,
                    tri_count: 0,
                    rmax,
                    first_tri: 0,
                }
            }
        })
        .collect();

    (nodes, bvh.prim_indices.clone())
}

/// Object-space positions of triangles `tri_offset..tri_offset + tri_count`
/// of the arena, dropping the w lane.
pub fn gather_triangles(vertices: &[Vec4], tri_offset: usize, tri_count: usize) -> Vec<Vec3> {
    vertices[tri_offset * 3..(tri_offset + tri_count) * 3]
        .iter()
        .map(|v| v.truncate())
        .collect()
}
