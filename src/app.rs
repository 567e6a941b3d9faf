//! Windowed application loop.
//!
//! [`run`] opens a window, builds a [`Graphics`] core on the wgpu backend,
//! calls `setup` once, and then every frame calls `update` and renders the
//! game objects with the draws it queued.

use std::sync::Arc;
use std::time::Instant;

use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::camera::Camera;
use crate::config::GraphicsConfig;
use crate::error::{RenderError, RenderResult};
use crate::geometry::GeometryId;
use crate::gfx::{ShaderHandle, WgpuApi};
use crate::graphics::{GeometryDraw, Graphics};
use crate::object::GameObjectManager;

/// Context provided during app setup.
pub struct SetupContext<'a> {
    pub graphics: &'a mut Graphics<WgpuApi>,
    pub objects: &'a mut GameObjectManager,
    pub camera: &'a mut Camera,
}

/// Per-frame context passed to the update closure.
pub struct Frame<'a> {
    pub graphics: &'a mut Graphics<WgpuApi>,
    pub objects: &'a mut GameObjectManager,
    pub camera: &'a mut Camera,
    /// Seconds since the loop started.
    pub time: f32,
    /// Seconds since the previous frame.
    pub dt: f32,
    draws: &'a mut Vec<GeometryDraw>,
}

impl Frame<'_> {
    /// Draws `geometry` once per visible opaque object this frame.
    pub fn draw_opaque(&mut self, geometry: GeometryId) {
        self.draws.push(GeometryDraw::opaque(geometry));
    }

    /// Draws `geometry` once per visible transparent object this frame.
    pub fn draw_transparent(&mut self, geometry: GeometryId) {
        self.draws.push(GeometryDraw::transparent(geometry));
    }

    /// Queues a draw with a custom program, e.g. a material's.
    pub fn draw_with_shader(&mut self, draw: GeometryDraw, shader: ShaderHandle) {
        self.draws.push(draw.with_shader(shader));
    }

    pub fn fps(&self) -> f32 {
        if self.dt > 0.0 { 1.0 / self.dt } else { 0.0 }
    }
}

type SetupFn = Box<dyn FnOnce(&mut SetupContext) -> RenderResult<()>>;
type UpdateFn = Box<dyn FnMut(&mut Frame)>;

enum RealwareApp {
    Pending {
        config: GraphicsConfig,
        setup: Option<SetupFn>,
        update: Option<UpdateFn>,
    },
    Running {
        window: Arc<Window>,
        graphics: Graphics<WgpuApi>,
        objects: GameObjectManager,
        camera: Camera,
        update: UpdateFn,
        draws: Vec<GeometryDraw>,
        start_time: Instant,
        last_frame: Instant,
    },
    Failed(Option<RenderError>),
}

/// Runs the application until the window closes.
///
/// # Example
/// ```ignore
/// realware::run(
///     GraphicsConfig::default().title("Cubes"),
///     |ctx| {
///         let quad = ctx.graphics.create_primitive(&Primitive::quad())?;
///         ctx.objects.spawn(GameObject::new("quad").with_geometry(quad))?;
///         Ok(())
///     },
///     |frame| {
///         if let Some(quad) = frame.objects.find("quad").and_then(|o| o.geometry) {
///             frame.draw_opaque(quad);
///         }
///     },
/// )?;
/// ```
pub fn run<S, U>(config: GraphicsConfig, setup: S, update: U) -> RenderResult<()>
where
    S: FnOnce(&mut SetupContext) -> RenderResult<()> + 'static,
    U: FnMut(&mut Frame) + 'static,
{
    config.validate()?;
    let event_loop = EventLoop::new().map_err(|e| {
        log::error!("Failed to create event loop: {}", e);
        RenderError::ResourceInitFailure(format!("event loop: {e}"))
    })?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = RealwareApp::Pending {
        config,
        setup: Some(Box::new(setup)),
        update: Some(Box::new(update)),
    };

    event_loop.run_app(&mut app).map_err(|e| {
        log::error!("Event loop failed: {}", e);
        RenderError::ResourceInitFailure(format!("event loop: {e}"))
    })?;

    match app {
        RealwareApp::Failed(Some(error)) => Err(error),
        _ => Ok(()),
    }
}

impl RealwareApp {
    fn start(
        event_loop: &ActiveEventLoop,
        config: GraphicsConfig,
        setup: SetupFn,
        update: UpdateFn,
    ) -> RenderResult<Self> {
        let window_attrs = WindowAttributes::default()
            .with_title(&config.window_title)
            .with_inner_size(winit::dpi::LogicalSize::new(
                config.window_width,
                config.window_height,
            ));
        let window = Arc::new(event_loop.create_window(window_attrs).map_err(|e| {
            log::error!("Failed to create window: {}", e);
            RenderError::ResourceInitFailure(format!("window: {e}"))
        })?);

        // The drawable may differ from the logical size on HiDPI displays.
        let size = window.inner_size();
        let config = config.size(size.width.max(1), size.height.max(1));

        let api = WgpuApi::new(window.clone())?;
        let mut graphics = Graphics::new(api, config)?;
        let mut objects = GameObjectManager::new(graphics.config().max_game_object_count);
        let mut camera = Camera::new();

        setup(&mut SetupContext {
            graphics: &mut graphics,
            objects: &mut objects,
            camera: &mut camera,
        })?;

        Ok(RealwareApp::Running {
            window,
            graphics,
            objects,
            camera,
            update,
            draws: Vec::new(),
            start_time: Instant::now(),
            last_frame: Instant::now(),
        })
    }
}

impl ApplicationHandler for RealwareApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let RealwareApp::Pending {
            config,
            setup,
            update,
        } = self
        else {
            return;
        };
        let (Some(setup_fn), Some(update_fn)) = (setup.take(), update.take()) else {
            return;
        };

        *self = match Self::start(event_loop, config.clone(), setup_fn, update_fn) {
            Ok(running) => running,
            Err(e) => {
                log::error!("Application setup failed: {}", e);
                event_loop.exit();
                RealwareApp::Failed(Some(e))
            }
        };
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let RealwareApp::Running {
            window,
            graphics,
            objects,
            camera,
            update,
            draws,
            start_time,
            last_frame,
        } = self
        else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = graphics.resize_render_targets(size.width, size.height) {
                    log::error!("Resize to {}x{} failed: {}", size.width, size.height, e);
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let time = start_time.elapsed().as_secs_f32();
                let dt = now.duration_since(*last_frame).as_secs_f32();
                *last_frame = now;

                draws.clear();
                let mut frame = Frame {
                    graphics: &mut *graphics,
                    objects: &mut *objects,
                    camera: &mut *camera,
                    time,
                    dt,
                    draws: &mut *draws,
                };
                update(&mut frame);

                if let Err(e) = graphics.render_frame(objects.objects(), camera, draws.as_slice()) {
                    log::error!("Frame failed: {}", e);
                }

                window.request_redraw();
            }
            _ => {}
        }
    }
}
