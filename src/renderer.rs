//! Renderer orchestration: scene upload, render targets, pre-recorded
//! per-image command buffers, the interactive frame loop, and offline
//! accumulation.
//!
//! The HDR accumulation image persists across frames; the ray generation
//! shader blends into it using the uniform's frame counter. Anything that
//! invalidates the history (resize, shader reload) resets that counter
//! instead of clearing the image.

use ash::vk;
use bytemuck::Zeroable;
use log::info;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;

use crate::accel::{BottomLevelAccel, TopLevelAccel};
use crate::camera::CameraFn;
use crate::context::DeviceContext;
use crate::resources::{
    cmd_copy_image, cmd_copy_image_to_buffer, cmd_transition_image, device_address, GpuBuffer,
    GpuImage, StagingBuffer, Texture,
};
use crate::rt_pipeline::{RtPipeline, CLOSEST_HIT_SHADER, MISS_SHADER, RAYGEN_SHADER};
use crate::camera::CameraMatrices;
use crate::scene::{EmitterEntry, MaterialRecord, Mesh, PerMeshData, TextureData};
use crate::shader_dir::ShaderDirectory;
use crate::swapchain::{
    frame_needs_rebuild, is_linear_color_space, tonemap_target_format, SwapChain,
};
use crate::tonemap::{TonemapPipeline, TONEMAP_SHADER};

/// Accumulation target format: full-float so many passes sum losslessly.
const HDR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub shader_dir: PathBuf,
    pub hdr: bool,
}

/// Scene upload result: everything the GPU reads during a trace.
struct SceneBuffers {
    blas_list: Vec<BottomLevelAccel>,
    tlas: TopLevelAccel,
    per_mesh_buffer: GpuBuffer,
    material_buffer: GpuBuffer,
    emitter_buffer: GpuBuffer,
    emitter_count: u32,
    textures: Vec<Texture>,
}

pub struct Renderer {
    ctx: DeviceContext,
    shaders: ShaderDirectory,
    scene: SceneBuffers,
    rt_pipeline: RtPipeline,
    tonemap: TonemapPipeline,
    camera: CameraFn,
    hdr_requested: bool,

    hdr_target: GpuImage,
    tonemap_target: GpuImage,
    extent: vk::Extent2D,
    /// Framebuffer size reported by the window on the last tick; the
    /// authoritative size for forced rebuilds, where the cached extent
    /// may be stale.
    window_size: (u32, u32),
    linear_output: bool,

    swapchain: Option<SwapChain>,
    command_buffers: Vec<vk::CommandBuffer>,

    pending_size: Option<(u32, u32)>,
    minimized: bool,
    reset_accumulation: bool,
    last_matrices: Option<CameraMatrices>,
    destroyed: bool,
}

impl Renderer {
    /// Interactive renderer presenting to `window`.
    pub fn new_windowed(
        window: &(impl HasDisplayHandle + HasWindowHandle),
        config: &RendererConfig,
        meshes: Vec<Mesh>,
        materials: Vec<MaterialRecord>,
        emitters: Vec<EmitterEntry>,
        texture_data: Vec<TextureData>,
        camera: CameraFn,
    ) -> Result<Self, String> {
        let ctx = DeviceContext::new_with_window(window)?;
        Self::create(ctx, config, meshes, materials, emitters, texture_data, camera, true)
    }

    /// Offline renderer with no surface or swapchain.
    pub fn new_headless(
        config: &RendererConfig,
        meshes: Vec<Mesh>,
        materials: Vec<MaterialRecord>,
        emitters: Vec<EmitterEntry>,
        texture_data: Vec<TextureData>,
        camera: CameraFn,
    ) -> Result<Self, String> {
        let ctx = DeviceContext::new_headless()?;
        Self::create(ctx, config, meshes, materials, emitters, texture_data, camera, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        mut ctx: DeviceContext,
        config: &RendererConfig,
        meshes: Vec<Mesh>,
        materials: Vec<MaterialRecord>,
        emitters: Vec<EmitterEntry>,
        texture_data: Vec<TextureData>,
        camera: CameraFn,
        windowed: bool,
    ) -> Result<Self, String> {
        let mut shaders = ShaderDirectory::new(&config.shader_dir)?;
        for name in [RAYGEN_SHADER, MISS_SHADER, CLOSEST_HIT_SHADER, TONEMAP_SHADER] {
            shaders.load(name)?;
        }

        let scene = upload_scene(&mut ctx, &meshes, &materials, &emitters, &texture_data)?;

        let swapchain = if windowed {
            Some(SwapChain::create(
                &ctx,
                config.width,
                config.height,
                config.hdr,
            )?)
        } else {
            None
        };

        let (extent, target_format, linear_output) = match &swapchain {
            Some(sc) => (
                sc.extent,
                tonemap_target_format(sc.surface_format.format),
                is_linear_color_space(sc.surface_format.color_space),
            ),
            None => (
                vk::Extent2D {
                    width: config.width,
                    height: config.height,
                },
                vk::Format::R8G8B8A8_UNORM,
                false,
            ),
        };

        let (hdr_target, tonemap_target) =
            create_render_targets(&mut ctx, extent, target_format)?;

        let mut rt_pipeline = RtPipeline::new(&mut ctx, &shaders)?;
        let mut tonemap = TonemapPipeline::new(&mut ctx, &shaders)?;
        tonemap.set_linear_output(linear_output)?;

        {
            let texture_refs: Vec<&Texture> = scene.textures.iter().collect();
            rt_pipeline.write_descriptors(
                &ctx.device,
                scene.tlas.accel,
                hdr_target.view,
                scene.material_buffer.buffer,
                &texture_refs,
            )?;
        }
        tonemap.write_descriptors(&ctx.device, hdr_target.view, tonemap_target.view);

        let mut renderer = Renderer {
            ctx,
            shaders,
            scene,
            rt_pipeline,
            tonemap,
            camera,
            hdr_requested: config.hdr,
            hdr_target,
            tonemap_target,
            extent,
            window_size: (extent.width, extent.height),
            linear_output,
            swapchain,
            command_buffers: Vec::new(),
            pending_size: None,
            minimized: false,
            reset_accumulation: true,
            last_matrices: None,
            destroyed: false,
        };

        if renderer.swapchain.is_some() {
            renderer.record_command_buffers()?;
        }

        info!("Renderer initialized at {}x{}", extent.width, extent.height);
        Ok(renderer)
    }

    /// Note a framebuffer size change. The swapchain is rebuilt lazily on
    /// the next tick; a zero dimension pauses rendering entirely.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.minimized = true;
            return;
        }
        self.minimized = false;
        if width != self.extent.width || height != self.extent.height {
            self.pending_size = Some((width, height));
        }
    }

    /// Drive one interactive frame: poll shaders, acquire, refresh the
    /// uniform, submit and present. Rebuild conditions from the swapchain
    /// are absorbed here. `width`/`height` is the window's current
    /// framebuffer size.
    pub fn tick(&mut self, width: u32, height: u32) -> Result<(), String> {
        if self.swapchain.is_none() {
            return Err("tick() requires a windowed renderer".to_string());
        }
        if width == 0 || height == 0 {
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;
        self.window_size = (width, height);

        if let Some((width, height)) = self.pending_size.take() {
            self.rebuild_swapchain(width, height)?;
        }

        if self.shaders.poll() {
            self.ctx.wait_idle();
            self.rt_pipeline.rebuild(&mut self.ctx, &self.shaders)?;
            self.tonemap.rebuild(&self.ctx, &self.shaders)?;
            self.record_command_buffers()?;
            self.reset_accumulation = true;
        }

        let swapchain = self.swapchain.as_mut().expect("checked above");
        let Some((image_index, acquire_suboptimal)) = swapchain.acquire(&self.ctx)? else {
            return self.rebuild_swapchain_current();
        };

        // acquire() waited this slot's fence; the shared uniform rewrite
        // stays ordered after that wait.
        let aspect = self.extent.width as f32 / self.extent.height as f32;
        let matrices = (self.camera)(aspect);
        // A moved camera invalidates the accumulated history.
        if self.last_matrices.is_some_and(|last| last != matrices) {
            self.reset_accumulation = true;
        }
        self.last_matrices = Some(matrices);
        let emitter_address = device_address(&self.ctx.device, self.scene.emitter_buffer.buffer);
        self.rt_pipeline.update_uniform(
            &matrices,
            emitter_address,
            self.scene.emitter_count,
            self.reset_accumulation,
        )?;
        self.reset_accumulation = false;

        let cmd = self.command_buffers[image_index as usize];
        let outcome = swapchain.submit_and_present(&self.ctx, cmd, image_index)?;
        if frame_needs_rebuild(acquire_suboptimal, outcome) {
            return self.rebuild_swapchain_current();
        }
        Ok(())
    }

    /// Rebuild against the window's current framebuffer size; the cached
    /// extent can be stale after an out-of-date acquire.
    fn rebuild_swapchain_current(&mut self) -> Result<(), String> {
        self.pending_size = None;
        let (width, height) = self.window_size;
        self.rebuild_swapchain_inner(width, height, true)
    }

    fn rebuild_swapchain(&mut self, width: u32, height: u32) -> Result<(), String> {
        self.rebuild_swapchain_inner(width, height, false)
    }

    fn rebuild_swapchain_inner(
        &mut self,
        width: u32,
        height: u32,
        force: bool,
    ) -> Result<(), String> {
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(());
        };
        if !force && width == self.extent.width && height == self.extent.height {
            return Ok(());
        }

        self.ctx.wait_idle();

        if force {
            // Invalidate the cached extent so recreate() does not no-op.
            swapchain.extent = vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            };
        }
        swapchain.recreate(&self.ctx, width, height, self.hdr_requested)?;
        self.extent = swapchain.extent;
        let target_format = tonemap_target_format(swapchain.surface_format.format);
        self.linear_output = is_linear_color_space(swapchain.surface_format.color_space);
        self.tonemap.set_linear_output(self.linear_output)?;

        let device = self.ctx.device.clone();
        self.hdr_target.destroy(&device, self.ctx.allocator_mut());
        self.tonemap_target.destroy(&device, self.ctx.allocator_mut());
        let (hdr_target, tonemap_target) =
            create_render_targets(&mut self.ctx, self.extent, target_format)?;
        self.hdr_target = hdr_target;
        self.tonemap_target = tonemap_target;

        let texture_refs: Vec<&Texture> = self.scene.textures.iter().collect();
        self.rt_pipeline.write_descriptors(
            &device,
            self.scene.tlas.accel,
            self.hdr_target.view,
            self.scene.material_buffer.buffer,
            &texture_refs,
        )?;
        self.tonemap
            .write_descriptors(&device, self.hdr_target.view, self.tonemap_target.view);

        self.record_command_buffers()?;
        self.reset_accumulation = true;

        info!(
            "Swapchain rebuilt at {}x{}",
            self.extent.width, self.extent.height
        );
        Ok(())
    }

    /// Record one command buffer per swapchain image: trace, tone-map,
    /// copy into the swapchain image, hand it to present.
    fn record_command_buffers(&mut self) -> Result<(), String> {
        let device = self.ctx.device.clone();
        let swapchain = self.swapchain.as_ref().ok_or("No swapchain")?;

        if !self.command_buffers.is_empty() {
            unsafe {
                device.free_command_buffers(self.ctx.command_pool, &self.command_buffers);
            }
            self.command_buffers.clear();
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(swapchain.images.len() as u32);
        self.command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate frame command buffers: {:?}", e))?
        };

        let per_mesh_address = device_address(&device, self.scene.per_mesh_buffer.buffer);

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin_info = vk::CommandBufferBeginInfo::default();
            unsafe {
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .map_err(|e| format!("Failed to begin frame command buffer: {:?}", e))?;
            }

            self.rt_pipeline.cmd_trace_rays(
                &self.ctx,
                cmd,
                self.extent.width,
                self.extent.height,
                per_mesh_address,
            );

            // Trace writes -> tonemap reads, both in GENERAL.
            cmd_transition_image(
                &device,
                cmd,
                self.hdr_target.image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            );

            self.tonemap.cmd_dispatch(&device, cmd, self.extent.width, self.extent.height);

            cmd_transition_image(
                &device,
                cmd,
                self.tonemap_target.image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
            );
            cmd_transition_image(
                &device,
                cmd,
                swapchain.images[i],
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            );

            cmd_copy_image(
                &device,
                cmd,
                self.tonemap_target.image,
                swapchain.images[i],
                self.extent,
            );

            cmd_transition_image(
                &device,
                cmd,
                swapchain.images[i],
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
            // Return the tonemap target for the next frame's dispatch.
            cmd_transition_image(
                &device,
                cmd,
                self.tonemap_target.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            );

            unsafe {
                device
                    .end_command_buffer(cmd)
                    .map_err(|e| format!("Failed to end frame command buffer: {:?}", e))?;
            }
        }
        Ok(())
    }

    /// Accumulate `passes` samples headlessly, tone-map, and return the
    /// 8-bit RGBA image.
    pub fn render_offline(&mut self, passes: u32) -> Result<(Vec<u8>, u32, u32), String> {
        if passes == 0 {
            return Err("Offline render needs at least one pass".to_string());
        }
        let device = self.ctx.device.clone();
        let per_mesh_address = device_address(&device, self.scene.per_mesh_buffer.buffer);
        let emitter_address = device_address(&device, self.scene.emitter_buffer.buffer);
        let aspect = self.extent.width as f32 / self.extent.height as f32;
        let matrices = (self.camera)(aspect);

        for pass in 0..passes {
            self.rt_pipeline.update_uniform(
                &matrices,
                emitter_address,
                self.scene.emitter_count,
                pass == 0,
            )?;
            // One submit per pass; the fence wait inside serializes the
            // uniform rewrite against the trace that reads it.
            let cmd = self.ctx.begin_single_commands()?;
            self.rt_pipeline.cmd_trace_rays(
                &self.ctx,
                cmd,
                self.extent.width,
                self.extent.height,
                per_mesh_address,
            );
            self.ctx.end_single_commands(cmd)?;
            if (pass + 1) % 64 == 0 || pass + 1 == passes {
                info!("Offline pass {}/{}", pass + 1, passes);
            }
        }

        let cmd = self.ctx.begin_single_commands()?;
        cmd_transition_image(
            &device,
            cmd,
            self.hdr_target.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        );
        self.tonemap
            .cmd_dispatch(&device, cmd, self.extent.width, self.extent.height);
        cmd_transition_image(
            &device,
            cmd,
            self.tonemap_target.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
        );
        let byte_count = self.extent.width as u64 * self.extent.height as u64 * 4;
        let mut staging = StagingBuffer::new(&device, self.ctx.allocator_mut(), byte_count)?;
        cmd_copy_image_to_buffer(
            &device,
            cmd,
            self.tonemap_target.image,
            staging.inner.buffer,
            self.extent,
        );
        cmd_transition_image(
            &device,
            cmd,
            self.tonemap_target.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        );
        self.ctx.end_single_commands(cmd)?;

        let pixels = staging.read(byte_count as usize)?;
        staging.destroy(&device, self.ctx.allocator_mut());

        Ok((pixels, self.extent.width, self.extent.height))
    }

    /// Synchronously read the raw HDR accumulation image back to the host
    /// as RGBA f32 texels.
    pub fn read_render_target(&mut self) -> Result<(Vec<f32>, u32, u32), String> {
        let device = self.ctx.device.clone();
        self.ctx.wait_idle();

        let byte_count = self.extent.width as u64 * self.extent.height as u64 * 16;
        let mut staging = StagingBuffer::new(&device, self.ctx.allocator_mut(), byte_count)?;

        let cmd = self.ctx.begin_single_commands()?;
        cmd_transition_image(
            &device,
            cmd,
            self.hdr_target.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::TRANSFER,
        );
        cmd_copy_image_to_buffer(
            &device,
            cmd,
            self.hdr_target.image,
            staging.inner.buffer,
            self.extent,
        );
        cmd_transition_image(
            &device,
            cmd,
            self.hdr_target.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        );
        self.ctx.end_single_commands(cmd)?;

        let bytes = staging.read(byte_count as usize)?;
        staging.destroy(&device, self.ctx.allocator_mut());

        let texels: Vec<f32> = bytemuck::cast_slice(&bytes).to_vec();
        Ok((texels, self.extent.width, self.extent.height))
    }

    /// Tone-map the current accumulation on the host and return RGBA8
    /// pixels, for on-demand snapshots of an interactive session.
    pub fn snapshot_rgba8(&mut self) -> Result<(Vec<u8>, u32, u32), String> {
        let (texels, width, height) = self.read_render_target()?;
        let pixels = texels
            .chunks_exact(4)
            .flat_map(|texel| {
                let encode = |c: f32| {
                    let c = c.max(0.0);
                    let mapped = (c / (1.0 + c)).powf(1.0 / 2.2);
                    (mapped * 255.0 + 0.5) as u8
                };
                [encode(texel[0]), encode(texel[1]), encode(texel[2]), 255]
            })
            .collect();
        Ok((pixels, width, height))
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.ctx.wait_idle();
        let device = self.ctx.device.clone();

        if !self.command_buffers.is_empty() {
            unsafe {
                device.free_command_buffers(self.ctx.command_pool, &self.command_buffers);
            }
            self.command_buffers.clear();
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.ctx);
        }

        self.tonemap.destroy(&mut self.ctx);
        self.rt_pipeline.destroy(&mut self.ctx);
        self.hdr_target.destroy(&device, self.ctx.allocator_mut());
        self.tonemap_target.destroy(&device, self.ctx.allocator_mut());

        for texture in &mut self.scene.textures {
            texture.destroy(&device, self.ctx.allocator_mut());
        }
        self.scene.per_mesh_buffer.destroy(&device, self.ctx.allocator_mut());
        self.scene.material_buffer.destroy(&device, self.ctx.allocator_mut());
        self.scene.emitter_buffer.destroy(&device, self.ctx.allocator_mut());
        self.scene.tlas.destroy(&mut self.ctx);
        for blas in &mut self.scene.blas_list {
            blas.destroy(&mut self.ctx);
        }

        self.ctx.destroy();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Build all acceleration structures and GPU-side scene tables.
fn upload_scene(
    ctx: &mut DeviceContext,
    meshes: &[Mesh],
    materials: &[MaterialRecord],
    emitters: &[EmitterEntry],
    texture_data: &[TextureData],
) -> Result<SceneBuffers, String> {
    if meshes.is_empty() {
        return Err("Scene contains no meshes".to_string());
    }
    if materials.is_empty() {
        return Err("Scene contains no materials".to_string());
    }

    let device = ctx.device.clone();

    let mut blas_list = Vec::with_capacity(meshes.len());
    for (i, mesh) in meshes.iter().enumerate() {
        let name = format!("mesh_{}", i);
        blas_list.push(BottomLevelAccel::build(ctx, mesh, &name)?);
    }
    let tlas = TopLevelAccel::build(ctx, &blas_list)?;

    let per_mesh: Vec<PerMeshData> = blas_list
        .iter()
        .zip(meshes)
        .map(|(blas, mesh)| PerMeshData {
            vertex_address: blas.vertex_address(&device),
            index_address: blas.index_address(&device),
            material_id: mesh.material_id,
            _pad: 0,
            emission: mesh.emission,
            _pad2: 0.0,
        })
        .collect();
    let per_mesh_buffer = GpuBuffer::new_with_data(
        &device,
        ctx.allocator_mut(),
        bytemuck::cast_slice(&per_mesh),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        "per_mesh_data",
    )?;

    let material_buffer = GpuBuffer::new_with_data(
        &device,
        ctx.allocator_mut(),
        bytemuck::cast_slice(materials),
        vk::BufferUsageFlags::STORAGE_BUFFER,
        "materials",
    )?;

    let emitter_count = emitters.len() as u32;
    // A zeroed placeholder keeps the buffer (and its address) valid for
    // scenes with no emitters; the shader checks the count first.
    let emitter_bytes: Vec<u8> = if emitters.is_empty() {
        bytemuck::bytes_of(&EmitterEntry::zeroed()).to_vec()
    } else {
        bytemuck::cast_slice(emitters).to_vec()
    };
    let emitter_buffer = GpuBuffer::new_with_data(
        &device,
        ctx.allocator_mut(),
        &emitter_bytes,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        "emitters",
    )?;

    let mut textures = Vec::with_capacity(texture_data.len().max(1));
    for (i, data) in texture_data.iter().enumerate() {
        let name = format!("texture_{}", i);
        textures.push(Texture::upload(ctx, data, &name)?);
    }
    if textures.is_empty() {
        // Binding 4 always needs a valid slot 0 to pad from.
        let white = TextureData {
            pixels: vec![255, 255, 255, 255],
            width: 1,
            height: 1,
        };
        textures.push(Texture::upload(ctx, &white, "fallback_white")?);
    }

    info!(
        "Scene uploaded: {} meshes, {} materials, {} emitter entries, {} textures",
        meshes.len(),
        materials.len(),
        emitter_count,
        textures.len()
    );

    Ok(SceneBuffers {
        blas_list,
        tlas,
        per_mesh_buffer,
        material_buffer,
        emitter_buffer,
        emitter_count,
        textures,
    })
}

/// The persistent HDR accumulation image and the display-ready tone-map
/// target, both left in GENERAL.
fn create_render_targets(
    ctx: &mut DeviceContext,
    extent: vk::Extent2D,
    target_format: vk::Format,
) -> Result<(GpuImage, GpuImage), String> {
    let hdr_target = GpuImage::new(
        ctx,
        extent.width,
        extent.height,
        HDR_FORMAT,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        vk::ImageLayout::GENERAL,
        "hdr_accumulation",
    )?;
    let tonemap_target = GpuImage::new(
        ctx,
        extent.width,
        extent.height,
        target_format,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        vk::ImageLayout::GENERAL,
        "tonemap_target",
    )?;
    Ok((hdr_target, tonemap_target))
}

#[cfg(test)]
mod tests {
    use crate::scene::{demo_scene, PerMeshData};

    #[test]
    fn per_mesh_records_match_mesh_count() {
        let (meshes, _, _) = demo_scene();
        // One record per mesh; index i must describe mesh i because the
        // shader indexes by instance custom index.
        let records: Vec<PerMeshData> = meshes
            .iter()
            .enumerate()
            .map(|(i, mesh)| PerMeshData {
                vertex_address: 0x1000 * (i as u64 + 1),
                index_address: 0x2000 * (i as u64 + 1),
                material_id: mesh.material_id,
                _pad: 0,
                emission: mesh.emission,
                _pad2: 0.0,
            })
            .collect();
        assert_eq!(records.len(), meshes.len());
        for (record, mesh) in records.iter().zip(&meshes) {
            assert_eq!(record.material_id, mesh.material_id);
            assert_eq!(record.emission, mesh.emission);
        }
    }
}
