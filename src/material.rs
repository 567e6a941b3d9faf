//! Materials and their registry.

use glam::Vec4;

use crate::error::{RenderError, RenderResult};
use crate::gfx::{GraphicsApi, ShaderHandle};
use crate::pool::{Identified, Pool, PoolHandle};
use crate::render_pass::RenderPath;
use crate::texture_atlas::AtlasTexture;

pub use crate::gfx::ShaderSource;

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub id: String,
    /// Atlas entry sampled for the diffuse color. A handle that no longer
    /// resolves is drawn untextured.
    pub diffuse_texture: Option<PoolHandle<AtlasTexture>>,
    pub diffuse_color: Vec4,
    pub highlight_color: Vec4,
    /// Derived program owned by this material.
    pub custom_shader: Option<ShaderHandle>,
}

impl Identified for Material {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Hook functions spliced into the base program of `render_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomShader {
    pub render_path: RenderPath,
    pub source: ShaderSource,
}

impl CustomShader {
    pub fn new(render_path: RenderPath, source: ShaderSource) -> Self {
        Self {
            render_path,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDesc {
    pub diffuse_texture: Option<PoolHandle<AtlasTexture>>,
    pub diffuse_color: Vec4,
    pub highlight_color: Vec4,
    pub custom_shader: Option<CustomShader>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            diffuse_texture: None,
            diffuse_color: Vec4::ONE,
            highlight_color: Vec4::ONE,
            custom_shader: None,
        }
    }
}

impl MaterialDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diffuse_texture(mut self, texture: PoolHandle<AtlasTexture>) -> Self {
        self.diffuse_texture = Some(texture);
        self
    }

    pub fn diffuse_color(mut self, color: Vec4) -> Self {
        self.diffuse_color = color;
        self
    }

    pub fn highlight_color(mut self, color: Vec4) -> Self {
        self.highlight_color = color;
        self
    }

    pub fn custom_shader(mut self, shader: CustomShader) -> Self {
        self.custom_shader = Some(shader);
        self
    }
}

pub struct MaterialRegistry {
    materials: Pool<Material>,
}

impl MaterialRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            materials: Pool::new("materials", capacity),
        }
    }

    /// Stores a new material. A custom shader is compiled against
    /// `base_shader` first; nothing is stored if that fails.
    pub fn create<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        id: &str,
        desc: MaterialDesc,
        base_shader: Option<ShaderHandle>,
    ) -> RenderResult<PoolHandle<Material>> {
        if self.materials.is_full() {
            log::error!("Material pool is full, cannot add '{}'", id);
            return Err(RenderError::CapacityExceeded {
                pool: "materials",
                capacity: self.materials.capacity(),
            });
        }
        if self.materials.find(id).is_some() {
            log::error!("Material '{}' already exists", id);
            return Err(RenderError::DuplicateId(id.to_string()));
        }

        let custom_shader = match &desc.custom_shader {
            Some(custom) => {
                let Some(base) = base_shader else {
                    log::error!(
                        "Material '{}': no {} base shader to derive from",
                        id,
                        custom.render_path.name()
                    );
                    return Err(RenderError::ResourceInitFailure(format!(
                        "material '{id}' has no {} base shader",
                        custom.render_path.name()
                    )));
                };
                Some(api.create_derived_shader(base, &custom.source)?)
            }
            None => None,
        };

        let material = Material {
            id: id.to_string(),
            diffuse_texture: desc.diffuse_texture,
            diffuse_color: desc.diffuse_color,
            highlight_color: desc.highlight_color,
            custom_shader,
        };
        match self.materials.add(material) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Some(shader) = custom_shader {
                    api.destroy_shader(shader);
                }
                Err(e)
            }
        }
    }

    /// Removes the material and releases its custom shader.
    pub fn destroy<A: GraphicsApi>(&mut self, api: &mut A, id: &str) -> bool {
        let Some(material) = self.materials.delete(id) else {
            return false;
        };
        if let Some(shader) = material.custom_shader {
            api.destroy_shader(shader);
        }
        true
    }

    pub fn find(&self, id: &str) -> Option<&Material> {
        self.materials.find(id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Material> {
        self.materials.find_mut(id)
    }

    pub fn handle_of(&self, id: &str) -> Option<PoolHandle<Material>> {
        self.materials.handle_of(id)
    }

    pub fn get(&self, handle: PoolHandle<Material>) -> Option<&Material> {
        self.materials.get(handle)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Releases every owned shader.
    pub fn destroy_all<A: GraphicsApi>(&mut self, api: &mut A) {
        for shader in self.materials.iter().filter_map(|m| m.custom_shader) {
            api.destroy_shader(shader);
        }
        self.materials.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{ApiCall, SoftwareApi};

    const BASE: &str = "fn vs() {}\n// #hooks\nfn tint() -> vec4<f32> { return vec4(1.0); }\n// #end-hooks\n";

    fn base_shader(api: &mut SoftwareApi) -> ShaderHandle {
        api.create_shader(RenderPath::Opaque, &ShaderSource::new("opaque", BASE))
            .unwrap()
    }

    #[test]
    fn create_and_find() {
        let mut api = SoftwareApi::new(4, 4);
        let mut materials = MaterialRegistry::new(4);
        let handle = materials
            .create(
                &mut api,
                "red",
                MaterialDesc::new().diffuse_color(Vec4::new(1.0, 0.0, 0.0, 1.0)),
                None,
            )
            .unwrap();

        assert_eq!(materials.find("red").unwrap().diffuse_color.x, 1.0);
        assert_eq!(materials.get(handle).unwrap().id, "red");
        assert!(matches!(
            materials.create(&mut api, "red", MaterialDesc::new(), None),
            Err(RenderError::DuplicateId(_))
        ));
    }

    #[test]
    fn custom_shader_is_owned() {
        let mut api = SoftwareApi::new(4, 4);
        let base = base_shader(&mut api);
        let mut materials = MaterialRegistry::new(4);
        let hooks = ShaderSource::new("glow", "fn tint() -> vec4<f32> { return vec4(2.0); }");

        materials
            .create(
                &mut api,
                "glow",
                MaterialDesc::new().custom_shader(CustomShader::new(RenderPath::Opaque, hooks)),
                Some(base),
            )
            .unwrap();
        let shader = materials.find("glow").unwrap().custom_shader.unwrap();
        assert_eq!(api.shader_count(), 2);

        assert!(materials.destroy(&mut api, "glow"));
        assert_eq!(api.shader_count(), 1);
        assert!(api.calls().contains(&ApiCall::DestroyShader(shader)));
        assert!(!materials.destroy(&mut api, "glow"));
    }

    #[test]
    fn failed_shader_stores_nothing() {
        let mut api = SoftwareApi::new(4, 4);
        let base = api
            .create_shader(RenderPath::Opaque, &ShaderSource::new("plain", "fn vs() {}"))
            .unwrap();
        let mut materials = MaterialRegistry::new(4);
        let custom = CustomShader::new(RenderPath::Opaque, ShaderSource::new("x", ""));

        assert!(materials
            .create(&mut api, "a", MaterialDesc::new().custom_shader(custom.clone()), Some(base))
            .is_err());
        assert!(materials
            .create(&mut api, "b", MaterialDesc::new().custom_shader(custom), None)
            .is_err());
        assert!(materials.is_empty());
        assert_eq!(api.shader_count(), 1);
    }

    #[test]
    fn full_registry_rejects() {
        let mut api = SoftwareApi::new(4, 4);
        let mut materials = MaterialRegistry::new(1);
        materials.create(&mut api, "a", MaterialDesc::new(), None).unwrap();
        assert!(matches!(
            materials.create(&mut api, "b", MaterialDesc::new(), None),
            Err(RenderError::CapacityExceeded { capacity: 1, .. })
        ));
        assert_eq!(materials.len(), 1);
    }
}
