//! Closest-hit traversal and ray/triangle intersection.

use smallvec::SmallVec;

use super::build::Bvh;
use crate::engine::Intersection;
use crate::util::{Ray, Vec3};

const MT_EPSILON: f32 = 1e-8;

/// Möller–Trumbore ray/triangle test. Returns `(t, u, v)` for hits in `(0, t_max)`.
#[inline]
pub fn intersect_triangle(ray: &Ray, v0: Vec3, v1: Vec3, v2: Vec3, t_max: f32) -> Option<(f32, f32, f32)> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < MT_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t > MT_EPSILON && t < t_max).then_some((t, u, v))
}

/// Walk `bvh` front to back, calling `visit_leaf` for every primitive in a
/// leaf whose bounds the ray reaches before the current closest hit.
pub fn traverse<F>(bvh: &Bvh, ray: &Ray, hit: &mut Intersection, mut visit_leaf: F)
where
    F: FnMut(u32, &mut Intersection),
{
    if bvh.prim_indices.is_empty() {
        return;
    }
    let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
    stack.push(0);

    while let Some(index) = stack.pop() {
        let node = &bvh.nodes[index as usize];
        if node.bounds.hit(ray, hit.t).is_none() {
            continue;
        }
        if node.is_leaf() {
            let first = node.left_or_first as usize;
            for &prim in &bvh.prim_indices[first..first + node.count as usize] {
                visit_leaf(prim, hit);
            }
            continue;
        }

        let left = node.left_or_first;
        let right = left + 1;
        let near_left = bvh.nodes[left as usize].bounds.hit(ray, hit.t);
        let near_right = bvh.nodes[right as usize].bounds.hit(ray, hit.t);
        // Push the farther child first so the nearer one is popped next
        match (near_left, near_right) {
            (Some(l), Some(r)) if l <= r => {
                stack.push(right);
                stack.push(left);
            }
            (Some(_), Some(_)) => {
                stack.push(left);
                stack.push(right);
            }
            (Some(_), None) => stack.push(left),
            (None, Some(_)) => stack.push(right),
            (None, None) => {}
        }
    }
}

/// Closest hit among `triangles` (three positions per primitive) through `bvh`.
///
/// Updates `hit` and returns true if a closer hit was found.
pub fn intersect_mesh(bvh: &Bvh, triangles: &[Vec3], ray: &Ray, hit: &mut Intersection) -> bool {
    let before = hit.t;
    traverse(bvh, ray, hit, |prim, hit| {
        let base = prim as usize * 3;
        if let Some((t, u, v)) =
            intersect_triangle(ray, triangles[base], triangles[base + 1], triangles[base + 2], hit.t)
        {
            hit.t = t;
            hit.u = u;
            hit.v = v;
            hit.prim = prim;
        }
    });
    hit.t < before
}
