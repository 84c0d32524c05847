//! Waypoint animation for demo objects.

use glam::EulerRot;

use crate::util::{Mat4, Quat, Vec3};

/// Moves an object back and forth between waypoints while spinning it.
///
/// Each leg takes `travel_duration` seconds; after the last waypoint the
/// motion loops back to the first.
#[derive(Clone, Debug)]
pub struct DemoMotion {
    positions: Vec<Vec3>,
    travel_duration: f32,
    /// Euler rotation rate in degrees per second.
    rotation_per_second: Vec3,
    current: usize,
    next: usize,
    elapsed: f32,
    position: Vec3,
    rotation: Quat,
}

impl DemoMotion {
    pub fn new(positions: Vec<Vec3>, travel_duration: f32, rotation_per_second: Vec3) -> Self {
        let position = positions.first().copied().unwrap_or(Vec3::ZERO);
        Self {
            positions,
            travel_duration: travel_duration.max(f32::EPSILON),
            rotation_per_second,
            current: 0,
            next: 1,
            elapsed: 0.0,
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Advance by `dt` seconds and return the new object-to-world transform.
    pub fn advance(&mut self, dt: f32) -> Mat4 {
        if self.positions.len() < 2 {
            return self.transform();
        }

        self.elapsed += dt;
        let t = (self.elapsed / self.travel_duration).clamp(0.0, 1.0);
        self.position = self.positions[self.current].lerp(self.positions[self.next], t);

        let spin = self.rotation_per_second * dt;
        self.rotation = (self.rotation
            * Quat::from_euler(
                EulerRot::YXZ,
                spin.y.to_radians(),
                spin.x.to_radians(),
                spin.z.to_radians(),
            ))
        .normalize();

        if t >= 1.0 {
            self.current = self.next;
            self.next = (self.next + 1) % self.positions.len();
            self.elapsed = 0.0;
        }

        self.transform()
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }
}
