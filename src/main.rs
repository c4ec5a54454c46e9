//! CLI entry point for the candela hardware ray tracer.
//!
//! Interactive mode opens a winit window and drives the swapchain frame
//! loop with shader hot reload. Offline mode accumulates a fixed number of
//! passes headlessly and writes a PNG.

mod accel;
mod camera;
mod context;
mod renderer;
mod resources;
mod rt_pipeline;
mod scene;
mod shader_dir;
mod swapchain;
mod tonemap;

use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};

use renderer::{Renderer, RendererConfig};

/// candela — hardware-accelerated path tracer on Vulkan RT.
#[derive(Parser)]
#[command(name = "candela", about = "Hardware ray traced renderer")]
struct Args {
    /// Directory containing the GLSL shader sources
    /// (candela.rgen/.rmiss/.rchit and tonemap.comp).
    #[arg(long, default_value = "shaders")]
    shaders: PathBuf,

    /// Framebuffer width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Framebuffer height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Prefer an HDR swapchain format when the surface offers one.
    #[arg(long)]
    hdr: bool,

    /// Render N accumulation passes headlessly instead of opening a
    /// window.
    #[arg(long, value_name = "PASSES")]
    offline: Option<u32>,

    /// Output PNG path for offline mode.
    #[arg(long, default_value = "output.png")]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    let config = RendererConfig {
        width: args.width,
        height: args.height,
        shader_dir: args.shaders.clone(),
        hdr: args.hdr,
    };

    match args.offline {
        Some(passes) => run_offline(&config, passes, &args.output),
        None => run_interactive(config),
    }
}

/// Headless accumulation: trace, tone-map, save.
fn run_offline(config: &RendererConfig, passes: u32, output: &Path) -> Result<(), String> {
    info!(
        "Offline render: {}x{}, {} passes",
        config.width, config.height, passes
    );

    let (meshes, materials, textures) = scene::demo_scene();
    let emitters = scene::build_emitter_table(&meshes);
    let mut renderer = Renderer::new_headless(
        config,
        meshes,
        materials,
        emitters,
        textures,
        camera::DefaultCamera::callback(),
    )?;

    let (pixels, width, height) = renderer.render_offline(passes)?;
    renderer.destroy();

    image::save_buffer(
        output,
        &pixels,
        width,
        height,
        image::ColorType::Rgba8,
    )
    .map_err(|e| format!("Failed to save PNG {}: {}", output.display(), e))?;

    info!("Saved {}", output.display());
    Ok(())
}

/// Best-effort snapshot of the current accumulation; failures only warn.
fn save_snapshot(renderer: &mut Renderer) {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = PathBuf::from(format!("snapshot_{}.png", stamp));
    match renderer.snapshot_rgba8() {
        Ok((pixels, width, height)) => {
            match image::save_buffer(&path, &pixels, width, height, image::ColorType::Rgba8) {
                Ok(()) => info!("Saved snapshot {}", path.display()),
                Err(e) => warn!("Failed to save snapshot {}: {}", path.display(), e),
            }
        }
        Err(e) => warn!("Failed to read snapshot pixels: {}", e),
    }
}

/// Interactive mode: window, swapchain loop, hot reload.
fn run_interactive(config: RendererConfig) -> Result<(), String> {
    use winit::application::ApplicationHandler;
    use winit::event::WindowEvent;
    use winit::event_loop::{ActiveEventLoop, EventLoop};
    use winit::keyboard::{KeyCode, PhysicalKey};
    use winit::window::{Window, WindowId};

    struct App {
        config: RendererConfig,
        window: Option<Window>,
        renderer: Option<Renderer>,
    }

    impl ApplicationHandler for App {
        fn resumed(&mut self, event_loop: &ActiveEventLoop) {
            if self.window.is_some() {
                return;
            }
            let window_attrs = Window::default_attributes()
                .with_title("candela")
                .with_inner_size(winit::dpi::LogicalSize::new(
                    self.config.width,
                    self.config.height,
                ));

            let window = match event_loop.create_window(window_attrs) {
                Ok(window) => window,
                Err(e) => {
                    error!("Failed to create window: {}", e);
                    event_loop.exit();
                    return;
                }
            };

            let (meshes, materials, textures) = scene::demo_scene();
            let emitters = scene::build_emitter_table(&meshes);
            match Renderer::new_windowed(
                &window,
                &self.config,
                meshes,
                materials,
                emitters,
                textures,
                camera::DefaultCamera::callback(),
            ) {
                Ok(renderer) => {
                    info!(
                        "Window created: {}x{}",
                        self.config.width, self.config.height
                    );
                    self.renderer = Some(renderer);
                    self.window = Some(window);
                }
                Err(e) => {
                    error!("Failed to create renderer: {}", e);
                    event_loop.exit();
                }
            }
        }

        fn window_event(
            &mut self,
            event_loop: &ActiveEventLoop,
            _window_id: WindowId,
            event: WindowEvent,
        ) {
            match event {
                WindowEvent::CloseRequested => {
                    info!("Window close requested");
                    event_loop.exit();
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    if !event.state.is_pressed() {
                        return;
                    }
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => event_loop.exit(),
                        PhysicalKey::Code(KeyCode::F12) => {
                            if let Some(renderer) = &mut self.renderer {
                                save_snapshot(renderer);
                            }
                        }
                        _ => {}
                    }
                }
                WindowEvent::Resized(size) => {
                    if let Some(renderer) = &mut self.renderer {
                        renderer.resize(size.width, size.height);
                    }
                }
                WindowEvent::RedrawRequested => {
                    if let (Some(renderer), Some(window)) = (&mut self.renderer, &self.window) {
                        let size = window.inner_size();
                        if let Err(e) = renderer.tick(size.width, size.height) {
                            error!("Frame failed: {}", e);
                            event_loop.exit();
                            return;
                        }
                        window.request_redraw();
                    }
                }
                _ => {}
            }
        }

        fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
            if let Some(mut renderer) = self.renderer.take() {
                renderer.destroy();
            }
        }
    }

    let event_loop = EventLoop::new().map_err(|e| format!("Failed to create event loop: {}", e))?;

    let mut app = App {
        config,
        window: None,
        renderer: None,
    };

    event_loop
        .run_app(&mut app)
        .map_err(|e| format!("Event loop error: {}", e))?;

    Ok(())
}
