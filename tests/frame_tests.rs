//! Frame pipeline tests on the software backend
//!
//! Tests for:
//! - Graphics::render_frame: pass order, instance counts, empty scenes
//! - Weighted blended transparency resolved over opaque color
//! - Text drawing through the font atlas
//! - Render target resizing
//! - Game object manager and pools seen through the public API

use approx::assert_abs_diff_eq;
use glam::{Vec3, Vec4};

use realware::gfx::ApiCall;
use realware::*;

const SIZE: u32 = 8;

fn graphics() -> Graphics<SoftwareApi> {
    let config = GraphicsConfig::default()
        .size(SIZE, SIZE)
        .with_capacity(16)
        .atlas_size(16, 16, 2);
    Graphics::new(SoftwareApi::new(SIZE, SIZE), config).unwrap()
}

fn assert_rgb(actual: Vec4, expected: Vec4, epsilon: f32) {
    assert_abs_diff_eq!(actual.x, expected.x, epsilon = epsilon);
    assert_abs_diff_eq!(actual.y, expected.y, epsilon = epsilon);
    assert_abs_diff_eq!(actual.z, expected.z, epsilon = epsilon);
}

/// A screen-filling 2D quad at clip depth `z`.
fn screen_quad(id: &str, quad: GeometryId, material: PoolHandle<Material>, z: f32) -> GameObject {
    GameObject::new(id)
        .with_geometry(quad)
        .with_material(material)
        .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, z)))
        .in_2d()
}

fn pass_path(graphics: &Graphics<SoftwareApi>, pass: RenderPassHandle) -> Option<RenderPath> {
    [
        RenderPath::Opaque,
        RenderPath::Transparent,
        RenderPath::Text,
        RenderPath::CompositeTransparent,
        RenderPath::CompositeFinal,
    ]
    .into_iter()
    .find(|&path| graphics.render_pass(path).handle() == pass)
}

// ============================================================================
// Frame ordering
// ============================================================================

#[test]
fn frame_runs_passes_in_order() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let red = g.create_material("red", MaterialDesc::new()).unwrap();
    let objects = vec![
        screen_quad("solid", quad, red, 0.5),
        screen_quad("glass", quad, red, 0.25).transparent(),
    ];

    g.api_mut().clear_calls();
    g.render_frame(
        &objects,
        &Camera::new(),
        &[GeometryDraw::opaque(quad), GeometryDraw::transparent(quad)],
    )
    .unwrap();

    let binds: Vec<_> = g
        .api()
        .calls()
        .iter()
        .filter_map(|call| match call {
            ApiCall::BindRenderPass { pass, .. } => pass_path(&g, *pass),
            _ => None,
        })
        .collect();
    assert_eq!(
        binds,
        [
            // clears
            RenderPath::Opaque,
            RenderPath::Transparent,
            RenderPath::Transparent,
            RenderPath::Text,
            // draws
            RenderPath::Opaque,
            RenderPath::Transparent,
            RenderPath::CompositeTransparent,
            RenderPath::CompositeFinal,
        ]
    );

    let instance_counts: Vec<_> = g
        .api()
        .draw_calls()
        .into_iter()
        .filter_map(|call| match call {
            ApiCall::Draw { instance_count, .. } => Some(*instance_count),
            _ => None,
        })
        .collect();
    assert_eq!(instance_counts, [1, 1]);
}

#[test]
fn empty_scene_uploads_nothing() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    g.api_mut().clear_calls();

    g.render_frame(&[], &Camera::new(), &[GeometryDraw::opaque(quad)])
        .unwrap();

    assert_eq!(g.api().uploaded_bytes(), 0);
    assert!(g.api().calls().iter().any(|call| matches!(
        call,
        ApiCall::Draw {
            instance_count: 0,
            ..
        }
    )));
    let background = g.api().read_surface(3, 3).unwrap();
    assert_rgb(background, Vec4::new(0.0, 0.0, 0.0, 1.0), 1e-6);
}

#[test]
fn hidden_objects_are_not_batched() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let mut hidden = GameObject::new("hidden").with_geometry(quad);
    hidden.visible = false;
    let objects = vec![
        hidden,
        GameObject::new("shown").with_geometry(quad),
        GameObject::new("no-geometry"),
    ];

    let stats = g.write_objects_to_opaque_buffers(&objects).unwrap();
    assert_eq!(stats.instances, 1);
    let stats = g.write_objects_to_transparent_buffers(&objects).unwrap();
    assert_eq!(stats.instances, 0);
}

// ============================================================================
// Transparency
// ============================================================================

#[test]
fn opaque_quad_reaches_the_surface() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let color = Vec4::new(0.9, 0.2, 0.2, 1.0);
    let red = g
        .create_material("red", MaterialDesc::new().diffuse_color(color))
        .unwrap();

    let objects = vec![screen_quad("solid", quad, red, 0.5)];
    g.render_frame(&objects, &Camera::new(), &[GeometryDraw::opaque(quad)])
        .unwrap();

    for (x, y) in [(0, 0), (4, 4), (7, 7)] {
        assert_rgb(g.api().read_surface(x, y).unwrap(), color, 0.01);
    }
}

#[test]
fn fully_opaque_transparent_quad_replaces_background() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let red = g
        .create_material("red", MaterialDesc::new().diffuse_color(Vec4::new(0.9, 0.2, 0.2, 1.0)))
        .unwrap();
    let blue = Vec4::new(0.2, 0.5, 1.0, 1.0);
    let glass = g
        .create_material("glass", MaterialDesc::new().diffuse_color(blue))
        .unwrap();

    let objects = vec![
        screen_quad("solid", quad, red, 0.5),
        screen_quad("glass", quad, glass, 0.25).transparent(),
    ];
    g.render_frame(
        &objects,
        &Camera::new(),
        &[GeometryDraw::opaque(quad), GeometryDraw::transparent(quad)],
    )
    .unwrap();

    assert_rgb(g.api().read_surface(4, 4).unwrap(), blue, 0.01);
}

#[test]
fn half_transparent_quad_blends_over_opaque() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
    let green = Vec4::new(0.0, 1.0, 0.0, 0.5);
    let solid = g
        .create_material("red", MaterialDesc::new().diffuse_color(red))
        .unwrap();
    let glass = g
        .create_material("green", MaterialDesc::new().diffuse_color(green))
        .unwrap();

    let objects = vec![
        screen_quad("solid", quad, solid, 0.5),
        screen_quad("glass", quad, glass, 0.25).transparent(),
    ];
    g.render_frame(
        &objects,
        &Camera::new(),
        &[GeometryDraw::opaque(quad), GeometryDraw::transparent(quad)],
    )
    .unwrap();

    let revealage = g
        .api()
        .read_texel(g.revealage_attachment(), 4, 4, 0)
        .unwrap();
    assert_abs_diff_eq!(revealage.x, 0.5, epsilon = 0.01);
    assert_rgb(
        g.api().read_surface(4, 4).unwrap(),
        Vec4::new(0.5, 0.5, 0.0, 1.0),
        0.02,
    );
}

#[test]
fn transparent_quad_behind_opaque_is_hidden() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
    let solid = g
        .create_material("red", MaterialDesc::new().diffuse_color(red))
        .unwrap();
    let glass = g
        .create_material("green", MaterialDesc::new().diffuse_color(Vec4::new(0.0, 1.0, 0.0, 0.5)))
        .unwrap();

    let objects = vec![
        screen_quad("solid", quad, solid, 0.25),
        screen_quad("glass", quad, glass, 0.5).transparent(),
    ];
    g.render_frame(
        &objects,
        &Camera::new(),
        &[GeometryDraw::opaque(quad), GeometryDraw::transparent(quad)],
    )
    .unwrap();

    let revealage = g
        .api()
        .read_texel(g.revealage_attachment(), 4, 4, 0)
        .unwrap();
    assert_abs_diff_eq!(revealage.x, 1.0, epsilon = 1e-6);
    assert_rgb(g.api().read_surface(4, 4).unwrap(), red, 0.01);
}

// ============================================================================
// Text
// ============================================================================

fn block_font(g: &mut Graphics<SoftwareApi>) -> FontId {
    let bitmap = |c| {
        (
            c,
            GlyphBitmap {
                width: 8,
                height: 8,
                left: 0.0,
                top: 8.0,
                advance: 8.0,
                coverage: vec![255; 64],
            },
        )
    };
    let font = Font::from_bitmaps(
        g.api_mut(),
        vec![bitmap('a'), bitmap('b')],
        FontMetrics::new(8.0, 4.0),
        8.0,
    )
    .unwrap();
    g.add_font(font)
}

#[test]
fn text_draws_one_quad_per_glyph() {
    let mut g = graphics();
    let font = block_font(&mut g);
    let objects = vec![GameObject::new("label").with_text(Text::new(font, "ab a\nb?"))];

    g.api_mut().clear_calls();
    g.draw_texts(&objects).unwrap();

    assert_eq!(g.api().draw_calls(), [&ApiCall::DrawQuads(4)]);
}

#[test]
fn text_is_drawn_over_the_scene() {
    let mut g = graphics();
    let font = block_font(&mut g);
    let objects = vec![GameObject::new("label").with_text(Text::new(font, "a"))];

    g.render_frame(&objects, &Camera::new(), &[]).unwrap();

    // The glyph covers the bottom-left quarter of the window.
    assert_rgb(g.api().read_surface(1, 1).unwrap(), Vec4::ONE, 0.01);
    assert_rgb(g.api().read_surface(6, 6).unwrap(), Vec4::ZERO, 1e-6);
}

#[test]
fn text_with_unknown_font_is_skipped() {
    let mut other = graphics();
    let font = block_font(&mut other);
    let mut g = graphics();
    let objects = vec![GameObject::new("label").with_text(Text::new(font, "a"))];

    g.api_mut().clear_calls();
    g.draw_texts(&objects).unwrap();
    assert!(g.api().draw_calls().is_empty());
}

// ============================================================================
// Resizing
// ============================================================================

#[test]
fn resize_to_current_size_changes_nothing() {
    let mut g = graphics();
    let color = g.color_attachment();
    g.api_mut().clear_calls();

    g.resize_render_targets(SIZE, SIZE).unwrap();
    g.resize_render_targets(0, 600).unwrap();

    assert!(g.api().calls().is_empty());
    assert_eq!(g.color_attachment(), color);
}

#[test]
fn resize_updates_attachments_and_viewports() {
    let mut g = graphics();
    g.resize_render_targets(16, 12).unwrap();

    assert_eq!(g.size(), (16, 12));
    assert_eq!(g.api().surface_size(), (16, 12));
    for texture in [
        g.color_attachment(),
        g.accumulation_attachment(),
        g.revealage_attachment(),
        g.depth_attachment(),
    ] {
        let desc = g.api().texture_desc(texture).unwrap();
        assert_eq!((desc.width, desc.height), (16, 12));
    }
    for path in [RenderPath::Opaque, RenderPath::CompositeFinal] {
        assert_eq!(g.render_pass(path).desc().viewport, Viewport::new(16, 12));
    }
    assert_eq!(
        g.render_pass(RenderPath::CompositeFinal)
            .input_texture("ColorTexture"),
        Some(g.color_attachment())
    );

    // Frames still render at the new size.
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let objects = vec![GameObject::new("solid").with_geometry(quad).in_2d()];
    g.render_frame(&objects, &Camera::new(), &[GeometryDraw::opaque(quad)])
        .unwrap();
    assert_rgb(g.api().read_surface(15, 11).unwrap(), Vec4::ONE, 0.01);
}

// ============================================================================
// Objects and pools
// ============================================================================

#[test]
fn object_manager_swap_removes() {
    let mut objects = GameObjectManager::new(4);
    for id in ["a", "b", "c"] {
        objects.spawn(GameObject::new(id)).unwrap();
    }
    let c = objects.create_game_object(Some("d")).unwrap();

    assert!(matches!(
        objects.spawn(GameObject::new("e")),
        Err(RenderError::CapacityExceeded { capacity: 4, .. })
    ));

    objects.destroy("a");
    let ids: Vec<_> = objects.objects().iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["d", "b", "c"]);
    assert_eq!(objects.get(c).map(|o| o.id.as_str()), Some("d"));
}

#[test]
fn generated_object_ids_are_unique() {
    let mut objects = GameObjectManager::new(8);
    let first = objects.create_game_object(None).unwrap();
    let second = objects.create_game_object(None).unwrap();
    assert_ne!(
        objects.get(first).map(|o| o.id.clone()),
        objects.get(second).map(|o| o.id.clone())
    );
}

#[test]
fn duplicate_material_is_rejected() {
    let mut g = graphics();
    g.create_material("shared", MaterialDesc::new()).unwrap();
    assert!(matches!(
        g.create_material("shared", MaterialDesc::new()),
        Err(RenderError::DuplicateId(_))
    ));
    assert_eq!(g.materials().len(), 1);
}

#[test]
fn geometry_is_packed_back_to_back() {
    let mut g = graphics();
    let quad = g.create_primitive(&Primitive::quad()).unwrap();
    let triangle = g.create_primitive(&Primitive::triangle()).unwrap();

    let quad = *g.geometry(quad).unwrap();
    let triangle = *g.geometry(triangle).unwrap();
    assert_eq!(quad.base_vertex, 0);
    assert_eq!(quad.first_index(), 0);
    assert_eq!(triangle.base_vertex, 4);
    assert_eq!(triangle.first_index(), 6);
    assert_eq!(triangle.index_count, 3);
}
