//! Vulkan device context: instance, physical-device selection, logical
//! device with the ray tracing extension set, queue, command pool,
//! allocator, and the one-shot command helper.
//!
//! Hardware ray tracing is mandatory here. A machine without the RT
//! extension set cannot run any part of the renderer, so selection fails
//! fatally instead of degrading.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{CStr, CString};

/// The device extensions every selected GPU must support.
const RT_EXTENSIONS: [&str; 4] = [
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
    "VK_KHR_buffer_device_address",
];

/// Core Vulkan state shared by every GPU component.
///
/// Fields are ordered so that Rust's drop order (top-to-bottom) destroys
/// resources before the device/instance they depend on; `destroy()` is the
/// explicit path and `Drop` is the backstop.
pub struct DeviceContext {
    pub rt_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,
    pub accel_loader: ash::khr::acceleration_structure::Device,
    pub rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,

    // Must be dropped before the device; Option so destroy() can take() it.
    allocator_inner: Option<Allocator>,

    pub command_pool: vk::CommandPool,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub surface_loader: Option<ash::khr::surface::Instance>,
    pub swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub surface: Option<vk::SurfaceKHR>,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    destroyed: bool,
}

impl DeviceContext {
    /// Create a context without a presentation surface (offline mode).
    pub fn new_headless() -> Result<Self, String> {
        Self::create(None)
    }

    /// Create a context with a surface for the given window.
    pub fn new_with_window(
        window: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> Result<Self, String> {
        let display_handle = window
            .display_handle()
            .map_err(|e| format!("Failed to get display handle: {}", e))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| format!("Failed to get window handle: {}", e))?;
        Self::create(Some((display_handle.as_raw(), window_handle.as_raw())))
    }

    fn create(
        window_handles: Option<(
            raw_window_handle::RawDisplayHandle,
            raw_window_handle::RawWindowHandle,
        )>,
    ) -> Result<Self, String> {
        let entry =
            unsafe { ash::Entry::load().map_err(|e| format!("Failed to load Vulkan: {}", e))? };

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"candela")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"candela")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut extension_names: Vec<*const i8> = Vec::new();
        if let Some((display, _)) = window_handles {
            let surface_extensions = ash_window::enumerate_required_extensions(display)
                .map_err(|e| format!("Failed to enumerate surface extensions: {:?}", e))?;
            extension_names.extend_from_slice(surface_extensions);
        }
        // Color-space negotiation beyond SRGB needs this instance extension.
        let swapchain_colorspace = CString::new("VK_EXT_swapchain_colorspace").unwrap();
        if window_handles.is_some() {
            let available = unsafe {
                entry
                    .enumerate_instance_extension_properties(None)
                    .unwrap_or_default()
            };
            let has_colorspace = available.iter().any(|ext| {
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
                    == swapchain_colorspace.as_c_str()
            });
            if has_colorspace {
                extension_names.push(swapchain_colorspace.as_ptr());
            }
        }

        let enable_validation = cfg!(debug_assertions);
        let mut layer_names: Vec<CString> = Vec::new();
        let debug_ext = CString::new("VK_EXT_debug_utils").unwrap();
        if enable_validation {
            let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) })
                    == validation_layer.as_c_str()
            });
            if has_validation {
                layer_names.push(validation_layer);
                extension_names.push(debug_ext.as_ptr());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_names);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if !layer_names.is_empty() {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };
            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Surface ---
        let (surface_loader, surface) = if let Some((display, window)) = window_handles {
            let surface = unsafe {
                ash_window::create_surface(&entry, &instance, display, window, None)
                    .map_err(|e| format!("Failed to create Vulkan surface: {:?}", e))?
            };
            let loader = ash::khr::surface::Instance::new(&entry, &instance);
            (Some(loader), Some(surface))
        } else {
            (None, None)
        };

        // --- Physical device selection ---
        let (physical_device, graphics_queue_family) =
            select_physical_device(&instance, surface_loader.as_ref(), surface)?;

        // --- Logical device ---
        let queue_priority = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priority)];

        let mut device_extensions: Vec<CString> = RT_EXTENSIONS
            .iter()
            .map(|name| CString::new(*name).unwrap())
            .collect();
        if surface.is_some() {
            device_extensions.push(CString::new("VK_KHR_swapchain").unwrap());
        }
        let device_ext_ptrs: Vec<*const i8> =
            device_extensions.iter().map(|n| n.as_ptr()).collect();

        // Base features the shaders rely on: 64-bit addresses, dynamic
        // indexing into the sampler array, and format-less storage writes
        // in the tone-map pass.
        let base_features = vk::PhysicalDeviceFeatures::default()
            .shader_int64(true)
            .shader_sampled_image_array_dynamic_indexing(true)
            .shader_storage_image_write_without_format(true);
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .scalar_block_layout(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_pipeline_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| format!("Failed to create logical device: {:?}", e))?
        };

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        // --- Command pool ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };

        // --- Allocator ---
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| format!("Failed to create GPU allocator: {:?}", e))?;

        // --- RT loaders and properties ---
        let rt_pipeline_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }
        info!(
            "RT properties: handle_size={}, handle_alignment={}, base_alignment={}",
            rt_props.shader_group_handle_size,
            rt_props.shader_group_handle_alignment,
            rt_props.shader_group_base_alignment
        );
        // The properties struct is plain-old-data; safe to transmute the lifetime.
        let rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> =
            unsafe { std::mem::transmute(rt_props) };

        let swapchain_loader = surface
            .is_some()
            .then(|| ash::khr::swapchain::Device::new(&instance, &device));

        info!("Device context initialized");

        Ok(DeviceContext {
            rt_pipeline_loader,
            accel_loader,
            rt_properties,
            allocator_inner: Some(allocator),
            command_pool,
            graphics_queue,
            graphics_queue_family,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            surface_loader,
            swapchain_loader,
            surface,
            instance,
            entry,
            destroyed: false,
        })
    }

    /// Get a mutable reference to the allocator. Panics after destroy().
    pub fn allocator_mut(&mut self) -> &mut Allocator {
        self.allocator_inner
            .as_mut()
            .expect("Allocator already destroyed")
    }

    /// Allocate and begin a one-shot command buffer.
    pub fn begin_single_commands(&self) -> Result<vk::CommandBuffer, String> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| format!("Failed to begin command buffer: {:?}", e))?;
        }

        Ok(cmd)
    }

    /// End, submit, fence-wait, and free a one-shot command buffer.
    pub fn end_single_commands(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| format!("Failed to create fence: {:?}", e))?
        };

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| format!("Failed to wait for fence: {:?}", e))?;
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.command_pool, &[cmd]);
        }

        Ok(())
    }

    /// Block until all submitted GPU work completes.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    /// Explicitly destroy all owned Vulkan objects in reverse dependency
    /// order. Callers must destroy their own resources first.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.wait_idle();

        if let (Some(surface_loader), Some(surface)) =
            (&self.surface_loader, self.surface.take())
        {
            unsafe { surface_loader.destroy_surface(surface, None) };
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }

        // The allocator must go before the device.
        drop(self.allocator_inner.take());

        unsafe {
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pick the GPU: among devices carrying the RT extension set (and a
/// graphics queue that can present to `surface` when one exists), prefer
/// discrete devices ranked by total DEVICE_LOCAL heap size, then
/// integrated ones. No qualifying device is fatal.
fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: Option<&ash::khr::surface::Instance>,
    surface: Option<vk::SurfaceKHR>,
) -> Result<(vk::PhysicalDevice, u32), String> {
    let physical_devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?
    };
    if physical_devices.is_empty() {
        return Err("No Vulkan-capable GPUs found".to_string());
    }

    let mut best: Option<(vk::PhysicalDevice, u32, bool, u64)> = None;

    for &phys_dev in &physical_devices {
        let props = unsafe { instance.get_physical_device_properties(phys_dev) };
        let api_version = props.api_version;
        if vk::api_version_major(api_version) < 1
            || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 2)
        {
            continue;
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
        let family = queue_families.iter().enumerate().find(|(idx, family)| {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = match (surface_loader, surface) {
                (Some(loader), Some(surface)) => unsafe {
                    loader
                        .get_physical_device_surface_support(phys_dev, *idx as u32, surface)
                        .unwrap_or(false)
                },
                _ => true,
            };
            graphics && present
        });
        let Some((family_idx, _)) = family else {
            continue;
        };

        let dev_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(phys_dev)
                .unwrap_or_default()
        };
        let has_rt = RT_EXTENSIONS.iter().all(|required| {
            dev_extensions.iter().any(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    == *required
            })
        });
        if !has_rt {
            continue;
        }

        let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        let local_memory = device_local_memory(instance, phys_dev);

        let better = match best {
            None => true,
            Some((_, _, best_discrete, best_memory)) => {
                (is_discrete && !best_discrete)
                    || (is_discrete == best_discrete && local_memory > best_memory)
            }
        };
        if better {
            let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            info!(
                "Candidate GPU: {} ({}, {} MiB device-local)",
                dev_name.to_string_lossy(),
                if is_discrete { "discrete" } else { "integrated" },
                local_memory / (1024 * 1024)
            );
            best = Some((phys_dev, family_idx as u32, is_discrete, local_memory));
        }
    }

    best.map(|(dev, family, _, _)| (dev, family)).ok_or_else(|| {
        "No GPU with hardware ray tracing support found (need Vulkan 1.2+ with \
         VK_KHR_ray_tracing_pipeline and VK_KHR_acceleration_structure)"
            .to_string()
    })
}

/// Sum of DEVICE_LOCAL heap sizes for a physical device.
fn device_local_memory(instance: &ash::Instance, phys_dev: vk::PhysicalDevice) -> u64 {
    let memory = unsafe { instance.get_physical_device_memory_properties(phys_dev) };
    memory.memory_heaps[..memory.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}
