use std::path::Path;

use realware::*;

fn main() -> RenderResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = Path::new("realware.toml");
    let config = if config_path.exists() {
        GraphicsConfig::load(config_path)?
    } else {
        GraphicsConfig::default()
            .title("Realware")
            .size(1280, 720)
            .with_capacity(1024)
            .atlas_size(1024, 1024, 2)
    };

    run(
        config,
        |ctx| {
            let quad = ctx.graphics.create_primitive(&Primitive::quad())?;

            let red = ctx.graphics.create_material(
                "red",
                MaterialDesc::new().diffuse_color(Vec4::new(0.9, 0.2, 0.2, 1.0)),
            )?;
            let glass = ctx.graphics.create_material(
                "glass",
                MaterialDesc::new().diffuse_color(Vec4::new(0.2, 0.5, 1.0, 0.4)),
            )?;
            let green = ctx.graphics.create_material(
                "green",
                MaterialDesc::new().diffuse_color(Vec4::new(0.3, 0.9, 0.3, 1.0)),
            )?;

            let mut ids = IdGenerator::new();
            for i in 0..5 {
                let x = i as f32 * 1.5 - 3.0;
                ctx.objects.spawn(
                    GameObject::new(ids.next("quad"))
                        .with_geometry(quad)
                        .with_material(red)
                        .with_transform(Transform::from_position(Vec3::new(x, 0.0, 0.0))),
                )?;
            }
            for i in 0..3 {
                let x = i as f32 * 1.5 - 1.5;
                ctx.objects.spawn(
                    GameObject::new(ids.next("glass"))
                        .with_geometry(quad)
                        .with_material(glass)
                        .with_transform(Transform::from_position(Vec3::new(x, 0.3, 1.0)))
                        .transparent(),
                )?;
            }
            ctx.objects.spawn(
                GameObject::new("spinner")
                    .with_geometry(quad)
                    .with_material(green)
                    .with_transform(Transform::from_position(Vec3::new(0.0, -1.5, 0.5))),
            )?;

            if let Ok(font_path) = std::env::var("REALWARE_FONT") {
                let font = ctx.graphics.load_font(&font_path, 24.0)?;
                ctx.objects.spawn(
                    GameObject::new("fps")
                        .with_text(Text::new(font, "FPS"))
                        .with_transform(Transform::from_position(Vec3::new(10.0, 10.0, 0.0)))
                        .in_2d(),
                )?;
            }

            *ctx.camera = Camera::new()
                .at(Vec3::new(0.0, 1.0, 6.0))
                .looking_at(Vec3::ZERO)
                .with_fov(60.0);
            Ok(())
        },
        move |frame| {
            let time = frame.time;
            let fps = frame.fps();
            if let Some(spinner) = frame.objects.find_mut("spinner") {
                spinner.transform.rotation.y = time;
            }
            if let Some(text) = frame.objects.find_mut("fps").and_then(|o| o.text.as_mut()) {
                text.string = format!("FPS: {fps:.0}");
            }

            // Every object shares the quad, so one draw per category covers them all.
            if let Some(quad) = frame.objects.find("spinner").and_then(|o| o.geometry) {
                frame.draw_opaque(quad);
                frame.draw_transparent(quad);
            }
        },
    )
}
