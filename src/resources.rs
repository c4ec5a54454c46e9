//! GPU resource layer: buffers, images, staging readback, and barrier
//! helpers. Image layouts are caller-guaranteed state; nothing here tracks
//! them automatically.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use crate::context::DeviceContext;
use crate::scene::TextureData;

/// GPU buffer with its allocation; exclusively owned, released once.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Create an empty buffer.
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self, String> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(|e| format!("Failed to create buffer '{}': {:?}", name, e))?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate memory for '{}': {:?}", name, e))?;

        unsafe {
            device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind buffer memory '{}': {:?}", name, e))?;
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Create a host-visible buffer and upload `data` at creation.
    pub fn new_with_data(
        device: &ash::Device,
        allocator: &mut Allocator,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self, String> {
        let mut buffer = Self::new(
            device,
            allocator,
            data.len() as u64,
            usage,
            MemoryLocation::CpuToGpu,
            name,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Overwrite the buffer's mapped contents from offset 0.
    pub fn write(&mut self, data: &[u8]) -> Result<(), String> {
        let allocation = self
            .allocation
            .as_mut()
            .ok_or("Buffer already destroyed")?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or("Buffer is not host-visible")?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        if let Some(alloc) = self.allocation.take() {
            let _ = allocator.free(alloc);
        }
        unsafe {
            device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Query a buffer's device address. Always queried fresh, never cached:
/// buffer ownership can change across a rebuild boundary.
pub fn device_address(device: &ash::Device, buffer: vk::Buffer) -> u64 {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { device.get_buffer_device_address(&info) }
}

/// GPU image plus its view and allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    /// Create a device-local 2D image and transition it from UNDEFINED to
    /// `initial_layout` through a one-shot command. Subsequent layouts are
    /// the caller's responsibility.
    pub fn new(
        ctx: &mut DeviceContext,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        initial_layout: vk::ImageLayout,
        name: &str,
    ) -> Result<Self, String> {
        let device = ctx.device.clone();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|e| format!("Failed to create image '{}': {:?}", name, e))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = ctx
            .allocator_mut()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate image memory '{}': {:?}", name, e))?;

        unsafe {
            device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind image memory '{}': {:?}", name, e))?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(|e| format!("Failed to create image view '{}': {:?}", name, e))?
        };

        if initial_layout != vk::ImageLayout::UNDEFINED {
            let cmd = ctx.begin_single_commands()?;
            cmd_transition_image(
                &device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                initial_layout,
                vk::AccessFlags::empty(),
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
            );
            ctx.end_single_commands(cmd)?;
        }

        Ok(GpuImage {
            image,
            view,
            allocation: Some(allocation),
            format,
            extent: vk::Extent2D { width, height },
        })
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe {
            device.destroy_image_view(self.view, None);
        }
        if let Some(alloc) = self.allocation.take() {
            let _ = allocator.free(alloc);
        }
        unsafe {
            device.destroy_image(self.image, None);
        }
    }
}

/// Sampled texture: OPTIMAL-tiled image + sampler, uploaded via staging
/// copy and left in SHADER_READ_ONLY_OPTIMAL.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
}

impl Texture {
    pub fn upload(ctx: &mut DeviceContext, data: &TextureData, name: &str) -> Result<Self, String> {
        let device = ctx.device.clone();

        let mut staging = GpuBuffer::new_with_data(
            &device,
            ctx.allocator_mut(),
            &data.pixels,
            vk::BufferUsageFlags::TRANSFER_SRC,
            name,
        )?;

        let image = GpuImage::new(
            ctx,
            data.width,
            data.height,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageLayout::UNDEFINED,
            name,
        )?;

        let cmd = ctx.begin_single_commands()?;
        cmd_transition_image(
            &device,
            cmd,
            image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: data.width,
                height: data.height,
                depth: 1,
            });
        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        cmd_transition_image(
            &device,
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        );
        ctx.end_single_commands(cmd)?;

        staging.destroy(&device, ctx.allocator_mut());

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe {
            device
                .create_sampler(&sampler_info, None)
                .map_err(|e| format!("Failed to create sampler '{}': {:?}", name, e))?
        };

        Ok(Texture { image, sampler })
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe {
            device.destroy_sampler(self.sampler, None);
        }
        self.image.destroy(device, allocator);
    }
}

/// Host-visible buffer for reading pixels back from the GPU.
pub struct StagingBuffer {
    pub inner: GpuBuffer,
}

impl StagingBuffer {
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        size: u64,
    ) -> Result<Self, String> {
        let inner = GpuBuffer::new(
            device,
            allocator,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback_staging",
        )?;
        Ok(StagingBuffer { inner })
    }

    /// Copy out the mapped contents.
    pub fn read(&self, byte_count: usize) -> Result<Vec<u8>, String> {
        let alloc = self
            .inner
            .allocation
            .as_ref()
            .ok_or("Staging buffer has no allocation")?;
        let mapped = alloc.mapped_slice().ok_or("Staging buffer is not mapped")?;
        if mapped.len() < byte_count {
            return Err(format!(
                "Mapped slice too small: {} < {}",
                mapped.len(),
                byte_count
            ));
        }
        Ok(mapped[..byte_count].to_vec())
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        self.inner.destroy(device, allocator);
    }
}

/// Record a single-image layout transition barrier.
#[allow(clippy::too_many_arguments)]
pub fn cmd_transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Record a full-extent image→image copy (both in TRANSFER layouts).
pub fn cmd_copy_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
) {
    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .layer_count(1);
    let region = vk::ImageCopy::default()
        .src_subresource(subresource)
        .dst_subresource(subresource)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        });
    unsafe {
        device.cmd_copy_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

/// Record an image→buffer copy (image in TRANSFER_SRC_OPTIMAL).
pub fn cmd_copy_image_to_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    buffer: vk::Buffer,
    extent: vk::Extent2D,
) {
    let region = vk::BufferImageCopy::default()
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        });
    unsafe {
        device.cmd_copy_image_to_buffer(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            buffer,
            &[region],
        );
    }
}

/// Align `value` up to `alignment` (power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_up(33, 16), 48);
    }
}
