//! Game objects: the things the frame batcher draws.
//!
//! A [`GameObject`] ties a transform to optional geometry, material and
//! text. Objects live in the [`GameObjectManager`]'s pool, and batching walks
//! that pool in storage order every frame.

use glam::{EulerRot, Mat4, Quat, Vec3};

use crate::error::RenderResult;
use crate::font::Text;
use crate::geometry::GeometryId;
use crate::ids::IdGenerator;
use crate::material::Material;
use crate::pool::{Identified, Pool, PoolHandle};

/// Position, rotation and scale of an object.
///
/// For 2D objects the position is in `[0, 1]` window units for text and clip
/// space for geometry; the scale of a text object is its glyph size in
/// pixels relative to the font size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    /// Euler angles in radians, applied X then Y then Z.
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    pub fn quat(&self) -> Quat {
        Quat::from_euler(
            EulerRot::ZYX,
            self.rotation.z,
            self.rotation.y,
            self.rotation.x,
        )
    }

    /// World matrix in scale, rotate, translate order.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.quat(), self.position)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameObject {
    pub id: String,
    pub visible: bool,
    /// Opaque objects go through the opaque pass, the rest through the
    /// transparent one.
    pub opaque: bool,
    /// Skip the camera and place the object directly in clip space.
    pub is_2d: bool,
    pub geometry: Option<GeometryId>,
    pub material: Option<PoolHandle<Material>>,
    pub text: Option<Text>,
    pub transform: Transform,
}

impl Identified for GameObject {
    fn id(&self) -> &str {
        &self.id
    }
}

impl GameObject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            visible: true,
            opaque: true,
            is_2d: false,
            geometry: None,
            material: None,
            text: None,
            transform: Transform::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: GeometryId) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_material(mut self, material: PoolHandle<Material>) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_text(mut self, text: Text) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn transparent(mut self) -> Self {
        self.opaque = false;
        self
    }

    pub fn in_2d(mut self) -> Self {
        self.is_2d = true;
        self
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.transform.matrix()
    }
}

pub struct GameObjectManager {
    objects: Pool<GameObject>,
    ids: IdGenerator,
}

impl GameObjectManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            objects: Pool::new("game objects", capacity),
            ids: IdGenerator::new(),
        }
    }

    /// Adds a default object. `None` picks the next generated id.
    pub fn create_game_object(&mut self, id: Option<&str>) -> RenderResult<PoolHandle<GameObject>> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.ids.next("game_object"),
        };
        self.objects.add(GameObject::new(id))
    }

    /// Adds a fully configured object.
    pub fn spawn(&mut self, object: GameObject) -> RenderResult<PoolHandle<GameObject>> {
        self.objects.add(object)
    }

    pub fn find(&self, id: &str) -> Option<&GameObject> {
        self.objects.find(id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut GameObject> {
        self.objects.find_mut(id)
    }

    pub fn get(&self, handle: PoolHandle<GameObject>) -> Option<&GameObject> {
        self.objects.get(handle)
    }

    pub fn get_mut(&mut self, handle: PoolHandle<GameObject>) -> Option<&mut GameObject> {
        self.objects.get_mut(handle)
    }

    pub fn destroy(&mut self, id: &str) -> Option<GameObject> {
        self.objects.delete(id)
    }

    /// Live objects in storage order.
    pub fn objects(&self) -> &[GameObject] {
        self.objects.as_slice()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.ids.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_matrix_is_srt() {
        let transform = Transform::new()
            .position(Vec3::new(1.0, 2.0, 3.0))
            .rotation(Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2))
            .uniform_scale(2.0);
        let p = transform.matrix().transform_point3(Vec3::X);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(p.y, 4.0, epsilon = 1e-5);
        assert_relative_eq!(p.z, 3.0, epsilon = 1e-5);
    }

    #[test]
    fn generated_ids_and_lookup() {
        let mut objects = GameObjectManager::new(4);
        let first = objects.create_game_object(None).unwrap();
        objects.create_game_object(Some("player")).unwrap();
        objects.create_game_object(None).unwrap();

        assert_eq!(objects.get(first).unwrap().id, "game_object_0");
        assert!(objects.find("game_object_1").is_some());
        assert!(objects.find("player").unwrap().visible);
    }

    #[test]
    fn destroy_swaps_last_into_place() {
        let mut objects = GameObjectManager::new(4);
        for id in ["a", "b", "c"] {
            objects.create_game_object(Some(id)).unwrap();
        }
        let c = objects.objects()[2].clone();
        objects.find_mut("c").unwrap().opaque = false;

        assert!(objects.destroy("a").is_some());
        let ids: Vec<_> = objects.objects().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);
        assert!(!objects.find(&c.id).unwrap().opaque);
        assert!(objects.destroy("a").is_none());
    }
}
