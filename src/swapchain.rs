//! Swapchain ownership and the frame-in-flight state machine.
//!
//! Two frame slots cycle through acquire/submit/present; each slot owns a
//! semaphore pair and a fence created signaled so the first wait passes.
//! Rebuild conditions (OUT_OF_DATE, SUBOPTIMAL) are reported through
//! return values; the caller decides when to recreate.

use ash::vk;
use log::info;

use crate::context::DeviceContext;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// HDR (format, color space) pairs tried in order when HDR output is
/// requested.
const HDR_PREFERENCES: [(vk::Format, vk::ColorSpaceKHR); 2] = [
    (
        vk::Format::R16G16B16A16_SFLOAT,
        vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
    ),
    (
        vk::Format::A2B10G10R10_UNORM_PACK32,
        vk::ColorSpaceKHR::HDR10_ST2084_EXT,
    ),
];

const SDR_FALLBACK: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick the surface format. Without the HDR flag the SDR fallback is used
/// even when extended formats are on offer; with it, the first available
/// preference wins and the fallback covers SDR-only surfaces.
pub fn negotiate_surface_format(
    available: &[vk::SurfaceFormatKHR],
    hdr: bool,
) -> vk::SurfaceFormatKHR {
    if hdr {
        for (format, color_space) in HDR_PREFERENCES {
            if available
                .iter()
                .any(|f| f.format == format && f.color_space == color_space)
            {
                return vk::SurfaceFormatKHR {
                    format,
                    color_space,
                };
            }
        }
    }
    available
        .iter()
        .copied()
        .find(|f| {
            f.format == SDR_FALLBACK.format && f.color_space == SDR_FALLBACK.color_space
        })
        .or_else(|| {
            available.iter().copied().find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| available.first().copied())
        .unwrap_or(SDR_FALLBACK)
}

/// Slot index for the frame after `current`.
pub fn next_slot(current: usize) -> usize {
    (current + 1) % MAX_FRAMES_IN_FLIGHT
}

/// Whether the tone-map shader should write linear values (the display
/// pipeline applies no further encode).
pub fn is_linear_color_space(color_space: vk::ColorSpaceKHR) -> bool {
    color_space == vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
}

/// Storage-capable format for the tone-map target, chosen so a raw image
/// copy into the swapchain image is texel-size compatible.
pub fn tonemap_target_format(surface_format: vk::Format) -> vk::Format {
    match surface_format {
        vk::Format::R16G16B16A16_SFLOAT => vk::Format::R16G16B16A16_SFLOAT,
        // 32-bit-per-texel surfaces, including the 10-bit packed one.
        _ => vk::Format::R8G8B8A8_UNORM,
    }
}

/// A recreate is only warranted when the framebuffer size actually
/// changed; a same-size resize event is a no-op.
pub fn needs_recreate(current: vk::Extent2D, width: u32, height: u32) -> bool {
    current.width != width || current.height != height
}

/// Result of pushing one frame through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Rendered { image_index: u32 },
    /// The surface changed underneath us; recreate and retry next tick.
    NeedsRebuild,
}

/// Whether this frame's acquire/present results require recreating the
/// swapchain. A suboptimal acquire still renders the frame (its signaled
/// semaphore must be consumed by a submit) but forces a rebuild after.
pub fn frame_needs_rebuild(acquire_suboptimal: bool, outcome: FrameOutcome) -> bool {
    acquire_suboptimal || outcome == FrameOutcome::NeedsRebuild
}

/// Resolve the swapchain extent. Surfaces reporting a fixed
/// current_extent dictate it; otherwise (current_extent == u32::MAX, as
/// on Wayland) the window's framebuffer size wins, clamped to the
/// capability bounds.
pub fn surface_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

struct FrameSlot {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

/// The swapchain plus its frame-pacing state.
pub struct SwapChain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
    pub surface_format: vk::SurfaceFormatKHR,

    slots: Vec<FrameSlot>,
    current_slot: usize,
    /// Fence of the slot last submitted against each swapchain image, so an
    /// image handed out again before that work finished can be waited on.
    images_in_flight: Vec<vk::Fence>,
}

impl SwapChain {
    pub fn create(
        ctx: &DeviceContext,
        width: u32,
        height: u32,
        hdr: bool,
    ) -> Result<Self, String> {
        let (handle, images, extent, surface_format) =
            create_swapchain(ctx, width, height, hdr, vk::SwapchainKHR::null())?;

        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let semaphore_info = vk::SemaphoreCreateInfo::default();
            // Signaled so the first frame's wait falls through.
            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            unsafe {
                slots.push(FrameSlot {
                    image_available: ctx
                        .device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| format!("Failed to create semaphore: {:?}", e))?,
                    render_finished: ctx
                        .device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(|e| format!("Failed to create semaphore: {:?}", e))?,
                    in_flight: ctx
                        .device
                        .create_fence(&fence_info, None)
                        .map_err(|e| format!("Failed to create fence: {:?}", e))?,
                });
            }
        }

        let images_in_flight = vec![vk::Fence::null(); images.len()];

        Ok(SwapChain {
            handle,
            images,
            extent,
            surface_format,
            slots,
            current_slot: 0,
            images_in_flight,
        })
    }

    /// Recreate for a new framebuffer size, handing the old swapchain to
    /// the new one. The surface format is renegotiated with the same HDR
    /// preference. No-op when the size is unchanged.
    pub fn recreate(
        &mut self,
        ctx: &DeviceContext,
        width: u32,
        height: u32,
        hdr: bool,
    ) -> Result<(), String> {
        if !needs_recreate(self.extent, width, height) {
            return Ok(());
        }
        ctx.wait_idle();

        let old = self.handle;
        let (handle, images, extent, surface_format) =
            create_swapchain(ctx, width, height, hdr, old)?;
        let swapchain_loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;
        unsafe {
            swapchain_loader.destroy_swapchain(old, None);
        }

        self.handle = handle;
        self.images = images;
        self.extent = extent;
        self.surface_format = surface_format;
        self.images_in_flight = vec![vk::Fence::null(); self.images.len()];
        Ok(())
    }

    /// Wait out the current slot and acquire the next image, reporting
    /// the acquire-side suboptimal flag. Returns None when the surface is
    /// out of date.
    pub fn acquire(&mut self, ctx: &DeviceContext) -> Result<Option<(u32, bool)>, String> {
        let slot = &self.slots[self.current_slot];
        unsafe {
            ctx.device
                .wait_for_fences(&[slot.in_flight], true, u64::MAX)
                .map_err(|e| format!("Failed to wait for frame fence: {:?}", e))?;
        }

        let swapchain_loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;
        let acquired = unsafe {
            swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                slot.image_available,
                vk::Fence::null(),
            )
        };
        let (image_index, suboptimal) = match acquired {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(None),
            Err(e) => return Err(format!("Failed to acquire swapchain image: {:?}", e)),
        };

        // The image may still be owned by an earlier slot's submission.
        let image_fence = self.images_in_flight[image_index as usize];
        if image_fence != vk::Fence::null() {
            unsafe {
                ctx.device
                    .wait_for_fences(&[image_fence], true, u64::MAX)
                    .map_err(|e| format!("Failed to wait for image fence: {:?}", e))?;
            }
        }
        self.images_in_flight[image_index as usize] = slot.in_flight;

        Ok(Some((image_index, suboptimal)))
    }

    /// Submit the recorded command buffer for `image_index`, present it,
    /// and advance to the next slot. Reports whether the swapchain must be
    /// rebuilt.
    pub fn submit_and_present(
        &mut self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<FrameOutcome, String> {
        let slot = &self.slots[self.current_slot];

        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [cmd];
        let signal_semaphores = [slot.render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            ctx.device
                .reset_fences(&[slot.in_flight])
                .map_err(|e| format!("Failed to reset frame fence: {:?}", e))?;
            ctx.device
                .queue_submit(ctx.graphics_queue, &[submit_info], slot.in_flight)
                .map_err(|e| format!("Failed to submit frame: {:?}", e))?;
        }

        let swapchain_loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_wait = [slot.render_finished];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&present_wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let present_result =
            unsafe { swapchain_loader.queue_present(ctx.graphics_queue, &present_info) };

        self.current_slot = next_slot(self.current_slot);

        match present_result {
            Ok(false) => Ok(FrameOutcome::Rendered { image_index }),
            // SUBOPTIMAL or OUT_OF_DATE: the frame may have shown, but the
            // swapchain no longer matches the surface.
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameOutcome::NeedsRebuild),
            Err(e) => Err(format!("Failed to present frame: {:?}", e)),
        }
    }

    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            for slot in self.slots.drain(..) {
                ctx.device.destroy_semaphore(slot.image_available, None);
                ctx.device.destroy_semaphore(slot.render_finished, None);
                ctx.device.destroy_fence(slot.in_flight, None);
            }
            if let Some(loader) = &ctx.swapchain_loader {
                loader.destroy_swapchain(self.handle, None);
            }
        }
    }
}

fn create_swapchain(
    ctx: &DeviceContext,
    width: u32,
    height: u32,
    hdr: bool,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(vk::SwapchainKHR, Vec<vk::Image>, vk::Extent2D, vk::SurfaceFormatKHR), String> {
    let surface = ctx.surface.ok_or("No surface for swapchain creation")?;
    let surface_loader = ctx.surface_loader.as_ref().ok_or("No surface loader")?;
    let swapchain_loader = ctx.swapchain_loader.as_ref().ok_or("No swapchain loader")?;

    let caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, surface)
            .map_err(|e| format!("Failed to get surface capabilities: {:?}", e))?
    };
    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, surface)
            .map_err(|e| format!("Failed to get surface formats: {:?}", e))?
    };

    let surface_format = negotiate_surface_format(&formats, hdr);

    let extent = surface_extent(&caps, width, height);

    let image_count = (caps.min_image_count + 1).min(if caps.max_image_count > 0 {
        caps.max_image_count
    } else {
        u32::MAX
    });

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(vk::PresentModeKHR::FIFO) // vsync
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe {
        swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| format!("Failed to create swapchain: {:?}", e))?
    };

    let images = unsafe {
        swapchain_loader
            .get_swapchain_images(handle)
            .map_err(|e| format!("Failed to get swapchain images: {:?}", e))?
    };

    info!(
        "Swapchain created: {}x{} format={:?} color_space={:?} images={}",
        extent.width,
        extent.height,
        surface_format.format,
        surface_format.color_space,
        images.len()
    );

    Ok((handle, images, extent, surface_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn sdr_is_chosen_unless_hdr_is_requested() {
        let available = [
            surface_format(
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            ),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = negotiate_surface_format(&available, false);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn hdr_prefers_extended_srgb_float() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            ),
            surface_format(
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            ),
        ];
        let chosen = negotiate_surface_format(&available, true);
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(
            chosen.color_space,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        );
    }

    #[test]
    fn hdr_falls_back_to_hdr10_then_sdr() {
        let hdr10_only = [
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            ),
        ];
        let chosen = negotiate_surface_format(&hdr10_only, true);
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);

        let sdr_only =
            [surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let chosen = negotiate_surface_format(&sdr_only, true);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn only_extended_srgb_linear_skips_the_gamma_encode() {
        assert!(is_linear_color_space(
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        ));
        assert!(!is_linear_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR));
        assert!(!is_linear_color_space(vk::ColorSpaceKHR::HDR10_ST2084_EXT));
    }

    #[test]
    fn slot_index_cycles_through_the_pool() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
        assert_eq!(next_slot(0), 1);
        assert_eq!(next_slot(1), 0);
    }

    #[test]
    fn suboptimal_acquire_forces_a_rebuild_after_presenting() {
        assert!(frame_needs_rebuild(
            true,
            FrameOutcome::Rendered { image_index: 0 }
        ));
        assert!(frame_needs_rebuild(false, FrameOutcome::NeedsRebuild));
        assert!(!frame_needs_rebuild(
            false,
            FrameOutcome::Rendered { image_index: 1 }
        ));
    }

    #[test]
    fn window_size_drives_the_extent_on_flexible_surfaces() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        caps.min_image_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 4096,
            height: 4096,
        };
        // The requested framebuffer size wins, not any previously cached
        // extent.
        let extent = surface_extent(&caps, 1600, 900);
        assert_eq!((extent.width, extent.height), (1600, 900));
        let extent = surface_extent(&caps, 8192, 8192);
        assert_eq!((extent.width, extent.height), (4096, 4096));

        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = surface_extent(&caps, 1600, 900);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn same_size_resize_is_a_no_op() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert!(!needs_recreate(current, 800, 600));
        assert!(needs_recreate(current, 801, 600));
        assert!(needs_recreate(current, 800, 599));
    }

    #[test]
    fn tonemap_target_matches_surface_texel_size() {
        assert_eq!(
            tonemap_target_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::Format::R16G16B16A16_SFLOAT
        );
        assert_eq!(
            tonemap_target_format(vk::Format::B8G8R8A8_SRGB),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            tonemap_target_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            vk::Format::R8G8B8A8_UNORM
        );
    }
}
