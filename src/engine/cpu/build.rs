//! SAH-based BVH builder.
//!
//! Builds a flat node array over a list of primitive bounds. Used for both
//! levels: triangles for a BLAS, instance world bounds for the TLAS.
//! Children of an internal node are always adjacent (`left`, `left + 1`).

use crate::util::{Aabb, Vec3};

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Flat BVH node.
///
/// Internal node: `left_or_first` = left child index, `count` = 0.
/// Leaf node: `left_or_first` = first slot in `prim_indices`, `count` > 0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildNode {
    pub bounds: Aabb,
    pub left_or_first: u32,
    pub count: u32,
}

impl BuildNode {
    const PLACEHOLDER: Self = Self {
        bounds: Aabb::EMPTY,
        left_or_first: 0,
        count: 0,
    };

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Built BVH.
#[derive(Clone, Debug, Default)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BuildNode>,
    /// Reordered primitive indices; leaves reference into this.
    pub prim_indices: Vec<u32>,
}

struct Bin {
    bounds: Aabb,
    count: usize,
}

/// Build a BVH from primitive bounds using SAH binning.
///
/// Deterministic: the same bounds always yield the same tree.
pub fn build_bvh(prims: &[Aabb], max_leaf_size: usize) -> Bvh {
    let n = prims.len();
    if n == 0 {
        return Bvh {
            nodes: vec![BuildNode::PLACEHOLDER],
            prim_indices: vec![],
        };
    }
    let max_leaf_size = max_leaf_size.max(1);

    let centroids: Vec<Vec3> = prims.iter().map(|b| b.centroid()).collect();
    let mut indices: Vec<u32> = (0..n as u32).collect();

    // Worst case: 2*n - 1 for a full binary tree
    let mut nodes: Vec<BuildNode> = Vec::with_capacity(2 * n);
    nodes.push(BuildNode::PLACEHOLDER);

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize, // exclusive
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let (start, end) = (task.start, task.end);
        let count = end - start;

        let mut bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            bounds.grow(&prims[idx as usize]);
        }

        let leaf = BuildNode {
            bounds,
            left_or_first: start as u32,
            count: count as u32,
        };

        if count <= max_leaf_size {
            nodes[task.node_idx] = leaf;
            continue;
        }

        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            centroid_bounds.grow_point(centroids[idx as usize]);
        }

        let split = find_best_split(&indices[start..end], prims, &centroids, &centroid_bounds);

        // Leaf if SAH says it is cheaper or every axis is degenerate
        let leaf_cost = count as f32 * INTERSECT_COST * bounds.area();
        let Some((axis, pos, _)) = split.filter(|&(_, _, cost)| cost < leaf_cost) else {
            nodes[task.node_idx] = leaf;
            continue;
        };

        let mid = partition(&mut indices[start..end], |&idx| centroids[idx as usize][axis] < pos) + start;

        // Degenerate partition: split in the middle
        let mid = if mid == start || mid == end { (start + end) / 2 } else { mid };

        let left_idx = nodes.len();
        nodes.push(BuildNode::PLACEHOLDER);
        nodes.push(BuildNode::PLACEHOLDER);

        nodes[task.node_idx] = BuildNode {
            bounds,
            left_or_first: left_idx as u32,
            count: 0,
        };

        // Right first so the left subtree is processed first
        stack.push(Task {
            node_idx: left_idx + 1,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left_idx,
            start,
            end: mid,
        });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// SAH binned split search across all 3 axes.
/// Returns (axis, split position, cost), or `None` if every axis is degenerate.
fn find_best_split(
    indices: &[u32],
    prims: &[Aabb],
    centroids: &[Vec3],
    centroid_bounds: &Aabb,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;

    for axis in 0..3 {
        let min = centroid_bounds.min[axis];
        let extent = centroid_bounds.max[axis] - min;
        if extent < 1e-8 {
            continue;
        }

        let mut bins: Vec<Bin> = (0..NUM_BINS)
            .map(|_| Bin {
                bounds: Aabb::EMPTY,
                count: 0,
            })
            .collect();

        let inv_extent = NUM_BINS as f32 / extent;
        for &idx in indices {
            let bin_id = (((centroids[idx as usize][axis] - min) * inv_extent) as usize).min(NUM_BINS - 1);
            bins[bin_id].bounds.grow(&prims[idx as usize]);
            bins[bin_id].count += 1;
        }

        // Sweep from left: prefix areas and counts
        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        // Sweep from right and evaluate
        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            if left_count[i - 1] == 0 || sweep_count == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());

            if best.is_none_or(|(_, _, c)| cost < c) {
                best = Some((axis, min + (i as f32 / NUM_BINS as f32) * extent, cost));
            }
        }
    }

    best
}

/// Partition slice in place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}
