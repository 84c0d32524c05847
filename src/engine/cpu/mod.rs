//! Reference [`AccelerationEngine`] running entirely on the CPU.
//!
//! BLAS builds are synchronous: a handle is ready as soon as `build_blas`
//! returns. Handles index a slot table; destroyed slots are reused by the
//! next build.

pub mod build;
pub mod bvh;
pub mod traverse;

use parking_lot::RwLock;

use self::build::{build_bvh, Bvh};
use self::bvh::{compress_blas, compress_tlas, gather_triangles, BlasNode, BlasVertex, TlasNode};
use super::{AccelerationEngine, BlasGeometryView, BlasHandle, Intersection, TlasView};
use crate::util::{Aabb, Error, Mat4, Ray, Result, Vec3, Vec4};

/// Maximum triangles per BLAS leaf.
const BLAS_LEAF_SIZE: usize = 4;
/// Maximum instances per TLAS leaf.
const TLAS_LEAF_SIZE: usize = 1;

struct BlasEntry {
    bvh: Bvh,
    /// Object-space positions, three per triangle in source order.
    triangles: Vec<Vec3>,
    compressed: Option<(Vec<BlasNode>, Vec<BlasVertex>)>,
    local_to_world: Mat4,
    world_to_local: Mat4,
}

impl BlasEntry {
    fn bounds(&self) -> Aabb {
        self.bvh.nodes[0].bounds
    }
}

struct TlasEntry {
    bvh: Bvh,
    /// Instance handles and their world-to-object transforms at build time.
    instances: Vec<(BlasHandle, Mat4)>,
    nodes: Vec<TlasNode>,
    indices: Vec<u32>,
}

/// CPU acceleration engine.
#[derive(Default)]
pub struct CpuEngine {
    blas: RwLock<Vec<Option<BlasEntry>>>,
    tlas: RwLock<Option<TlasEntry>>,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of BLAS currently alive.
    pub fn live_blas_count(&self) -> usize {
        self.blas.read().iter().filter(|e| e.is_some()).count()
    }

    /// True if a TLAS is currently built.
    pub fn has_tlas(&self) -> bool {
        self.tlas.read().is_some()
    }

    /// Closest hit of `ray` (world space) against one BLAS entry.
    fn intersect_entry(entry: &BlasEntry, world_to_local: &Mat4, ray: &Ray, hit: &mut Intersection) -> bool {
        let local = ray.transformed(world_to_local);
        traverse::intersect_mesh(&entry.bvh, &entry.triangles, &local, hit)
    }
}

impl AccelerationEngine for CpuEngine {
    fn build_blas(
        &self,
        vertices: &[Vec4],
        tri_offset: usize,
        tri_count: usize,
        compressed: bool,
    ) -> Result<BlasHandle> {
        if tri_count == 0 {
            return Err(Error::engine("mesh has no triangles"));
        }
        let end = tri_offset + tri_count;
        if end * 3 > vertices.len() {
            return Err(Error::RangeOutOfBounds {
                offset: tri_offset,
                end,
                available: vertices.len() / 3,
            });
        }

        let triangles = gather_triangles(vertices, tri_offset, tri_count);
        let aabbs: Vec<Aabb> = triangles
            .chunks_exact(3)
            .map(|t| Aabb::from_triangle(t[0], t[1], t[2]))
            .collect();
        let bvh = {
            let _span = tracing::debug_span!("build_blas", tri_count).entered();
            build_bvh(&aabbs, BLAS_LEAF_SIZE)
        };
        let compressed = compressed.then(|| compress_blas(&bvh, &triangles));

        let entry = BlasEntry {
            bvh,
            triangles,
            compressed,
            local_to_world: Mat4::IDENTITY,
            world_to_local: Mat4::IDENTITY,
        };

        let mut table = self.blas.write();
        let slot = match table.iter().position(Option::is_none) {
            Some(free) => {
                table[free] = Some(entry);
                free
            }
            None => {
                table.push(Some(entry));
                table.len() - 1
            }
        };
        Ok(BlasHandle(slot as u32))
    }

    fn is_ready(&self, handle: BlasHandle) -> bool {
        self.blas
            .read()
            .get(handle.0 as usize)
            .is_some_and(Option::is_some)
    }

    fn blas_node_bytes(&self, handle: BlasHandle) -> usize {
        self.blas
            .read()
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .and_then(|e| e.compressed.as_ref())
            .map_or(0, |(nodes, _)| std::mem::size_of_val(nodes.as_slice()))
    }

    fn blas_tri_bytes(&self, handle: BlasHandle) -> usize {
        self.blas
            .read()
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .and_then(|e| e.compressed.as_ref())
            .map_or(0, |(_, tris)| std::mem::size_of_val(tris.as_slice()))
    }

    fn read_blas_geometry(&self, handle: BlasHandle, visit: &mut dyn FnMut(BlasGeometryView<'_>)) -> Result<()> {
        let table = self.blas.read();
        let entry = table
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle(handle.0))?;
        let (nodes, triangles) = entry
            .compressed
            .as_ref()
            .ok_or_else(|| Error::GeometryFetch(format!("{handle} was built without compression")))?;
        visit(BlasGeometryView {
            nodes: bytemuck::cast_slice(nodes),
            triangles: bytemuck::cast_slice(triangles),
        });
        Ok(())
    }

    fn update_transform(&self, handle: BlasHandle, local_to_world: &Mat4) {
        if let Some(Some(entry)) = self.blas.write().get_mut(handle.0 as usize) {
            entry.local_to_world = *local_to_world;
            entry.world_to_local = local_to_world.inverse();
        }
    }

    fn destroy_blas(&self, handle: BlasHandle) {
        if let Some(slot) = self.blas.write().get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn build_tlas(&self, instances: &[BlasHandle]) -> Result<()> {
        if instances.is_empty() {
            return Err(Error::TlasBuildFailed("no instances".into()));
        }

        let table = self.blas.read();
        let mut bounds = Vec::with_capacity(instances.len());
        let mut placed = Vec::with_capacity(instances.len());
        for &handle in instances {
            let entry = table
                .get(handle.0 as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| Error::TlasBuildFailed(format!("{handle} is not a live BLAS")))?;
            bounds.push(entry.bounds().transformed(&entry.local_to_world));
            placed.push((handle, entry.world_to_local));
        }
        drop(table);

        let bvh = build_bvh(&bounds, TLAS_LEAF_SIZE);
        let (nodes, indices) = compress_tlas(&bvh);
        *self.tlas.write() = Some(TlasEntry {
            bvh,
            instances: placed,
            nodes,
            indices,
        });
        Ok(())
    }

    fn destroy_tlas(&self) {
        *self.tlas.write() = None;
    }

    fn tlas_node_bytes(&self) -> usize {
        self.tlas
            .read()
            .as_ref()
            .map_or(0, |t| std::mem::size_of_val(t.nodes.as_slice()))
    }

    fn tlas_index_bytes(&self) -> usize {
        self.tlas
            .read()
            .as_ref()
            .map_or(0, |t| std::mem::size_of_val(t.indices.as_slice()))
    }

    fn read_tlas(&self, visit: &mut dyn FnMut(TlasView<'_>)) -> Result<()> {
        let tlas = self.tlas.read();
        let tlas = tlas.as_ref().ok_or(Error::TlasFetch)?;
        visit(TlasView {
            nodes: bytemuck::cast_slice(&tlas.nodes),
            indices: bytemuck::cast_slice(&tlas.indices),
        });
        Ok(())
    }

    fn intersect_tlas(&self, origin: Vec3, direction: Vec3) -> Intersection {
        let mut hit = Intersection::default();
        let tlas = self.tlas.read();
        let Some(tlas) = tlas.as_ref() else {
            return hit;
        };
        let table = self.blas.read();
        let ray = Ray::new(origin, direction);

        traverse::traverse(&tlas.bvh, &ray, &mut hit, |inst, hit| {
            let (handle, world_to_local) = tlas.instances[inst as usize];
            // Instances destroyed since the TLAS build are skipped
            let Some(Some(entry)) = table.get(handle.0 as usize) else {
                return;
            };
            if Self::intersect_entry(entry, &world_to_local, &ray, hit) {
                hit.inst = inst;
                hit.aux = handle.0 as u64;
            }
        });
        hit
    }

    fn intersect_blas(&self, handle: BlasHandle, origin: Vec3, direction: Vec3) -> Intersection {
        let mut hit = Intersection::default();
        let table = self.blas.read();
        if let Some(Some(entry)) = table.get(handle.0 as usize) {
            let ray = Ray::new(origin, direction);
            if Self::intersect_entry(entry, &entry.world_to_local, &ray, &mut hit) {
                hit.aux = handle.0 as u64;
            }
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BLAS_NODE_STRIDE, BLAS_TRI_STRIDE, TLAS_INDEX_STRIDE, TLAS_NODE_STRIDE};

    /// `count` unit triangles along +X at spacing 2, as arena positions.
    fn arena(count: usize) -> Vec<Vec4> {
        (0..count)
            .flat_map(|i| {
                let x = i as f32 * 2.0;
                [
                    Vec4::new(x, 0.0, 0.0, 1.0),
                    Vec4::new(x + 1.0, 0.0, 0.0, 1.0),
                    Vec4::new(x, 1.0, 0.0, 1.0),
                ]
            })
            .collect()
    }

    #[test]
    fn test_build_sizes_are_stride_multiples() {
        let engine = CpuEngine::new();
        let vertices = arena(30);
        let h = engine.build_blas(&vertices, 10, 20, true).unwrap();
        assert!(engine.is_ready(h));
        assert_eq!(engine.blas_node_bytes(h) % BLAS_NODE_STRIDE, 0);
        assert_eq!(engine.blas_tri_bytes(h), 20 * 3 * BLAS_TRI_STRIDE);

        let mut seen = (0, 0);
        engine
            .read_blas_geometry(h, &mut |view| seen = (view.nodes.len(), view.triangles.len()))
            .unwrap();
        assert_eq!(seen, (engine.blas_node_bytes(h), engine.blas_tri_bytes(h)));
    }

    #[test]
    fn test_build_rejects_bad_ranges() {
        let engine = CpuEngine::new();
        let vertices = arena(5);
        assert!(matches!(
            engine.build_blas(&vertices, 3, 4, true),
            Err(Error::RangeOutOfBounds { available: 5, .. })
        ));
        assert!(engine.build_blas(&vertices, 0, 0, true).is_err());
        assert_eq!(engine.live_blas_count(), 0);
    }

    #[test]
    fn test_uncompressed_has_no_geometry() {
        let engine = CpuEngine::new();
        let h = engine.build_blas(&arena(4), 0, 4, false).unwrap();
        assert!(engine.is_ready(h));
        assert_eq!(engine.blas_node_bytes(h), 0);
        assert!(matches!(
            engine.read_blas_geometry(h, &mut |_| {}),
            Err(Error::GeometryFetch(_))
        ));
    }

    #[test]
    fn test_rebuild_is_deterministic_and_reuses_slot() {
        let engine = CpuEngine::new();
        let vertices = arena(17);
        let h = engine.build_blas(&vertices, 0, 17, true).unwrap();
        let sizes = (engine.blas_node_bytes(h), engine.blas_tri_bytes(h));

        engine.destroy_blas(h);
        assert!(!engine.is_ready(h));
        assert_eq!(engine.blas_node_bytes(h), 0);

        let again = engine.build_blas(&vertices, 0, 17, true).unwrap();
        assert_eq!(again, h);
        assert_eq!((engine.blas_node_bytes(again), engine.blas_tri_bytes(again)), sizes);
    }

    #[test]
    fn test_tlas_and_queries() {
        let engine = CpuEngine::new();
        let vertices = arena(3);
        let a = engine.build_blas(&vertices, 0, 3, true).unwrap();
        let b = engine.build_blas(&vertices, 0, 3, true).unwrap();
        engine.update_transform(b, &Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0)));

        assert!(matches!(engine.read_tlas(&mut |_| {}), Err(Error::TlasFetch)));
        engine.build_tlas(&[a, b]).unwrap();
        assert_eq!(engine.tlas_index_bytes(), 2 * TLAS_INDEX_STRIDE);
        assert_eq!(engine.tlas_node_bytes() % TLAS_NODE_STRIDE, 0);

        // Second instance, second triangle, moved up by 10
        let hit = engine.intersect_tlas(Vec3::new(2.2, 10.2, -4.0), Vec3::Z);
        assert!(hit.is_hit());
        assert_eq!(hit.inst, 1);
        assert_eq!(hit.prim, 1);
        assert_eq!(hit.aux, b.0 as u64);
        assert!((hit.t - 4.0).abs() < 1e-5);

        // Nothing at the untransformed location of the second instance's slot
        let miss = engine.intersect_tlas(Vec3::new(2.2, 5.0, -4.0), Vec3::Z);
        assert!(!miss.is_hit());

        let direct = engine.intersect_blas(a, Vec3::new(4.2, 0.2, -1.0), Vec3::Z);
        assert_eq!(direct.prim, 2);

        engine.destroy_tlas();
        assert_eq!(engine.tlas_node_bytes(), 0);
        assert!(!engine.intersect_tlas(Vec3::new(2.2, 10.2, -4.0), Vec3::Z).is_hit());
    }

    #[test]
    fn test_tlas_rejects_dead_handles() {
        let engine = CpuEngine::new();
        let a = engine.build_blas(&arena(1), 0, 1, true).unwrap();
        engine.destroy_blas(a);
        assert!(matches!(engine.build_tlas(&[a]), Err(Error::TlasBuildFailed(_))));
        assert!(engine.build_tlas(&[]).is_err());
    }
}
