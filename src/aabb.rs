use glam::Vec3;

/// Axis-aligned bounding box. The empty box is inverted (`+inf` min,
/// `-inf` max) so that the first point grown into it sets real bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };

    pub fn from_points(points: &[Vec3]) -> Self {
        let mut aabb = Self::EMPTY;
        for &p in points {
            aabb.grow(p);
        }
        aabb
    }

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn grow_aabb(&mut self, other: &Aabb) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let extent = self.max - self.min;
        2.0 * (extent.x * extent.y + extent.x * extent.z + extent.y * extent.z)
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn longest_extent(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        (self.max - self.min).max_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_box_is_identity_for_growth() {
        let mut a = Aabb::EMPTY;
        assert!(a.is_empty());
        assert_eq!(a.surface_area(), 0.0);

        a.grow(Vec3::new(1.0, 2.0, 3.0));
        assert!(!a.is_empty());
        assert_eq!(a.min, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(a.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn min_never_exceeds_max_after_growth() {
        let mut a = Aabb::EMPTY;
        for p in [
            Vec3::new(3.0, -1.0, 0.5),
            Vec3::new(-2.0, 4.0, 0.0),
            Vec3::new(0.0, 0.0, -7.0),
        ] {
            a.grow(p);
        }
        for k in 0..3 {
            assert!(a.min[k] <= a.max[k]);
        }
    }

    #[test]
    fn surface_area_of_unit_cube() {
        let a = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        assert_eq!(a.surface_area(), 6.0);
        assert_eq!(a.centroid(), Vec3::splat(0.5));
    }

    #[test]
    fn growing_by_empty_box_changes_nothing() {
        let mut a = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        let before = a;
        a.grow_aabb(&Aabb::EMPTY);
        assert_eq!(a, before);
    }
}
