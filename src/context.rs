//! Headless Vulkan device bring-up and raw buffer helpers.
//!
//! The graph engine does not own windowing or swapchains; it only needs an
//! instance, a physical device with a combined graphics+compute queue
//! family, a logical device and that one queue. `DeviceContext` bundles
//! those together for surface-free (compute and offscreen) use.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::GraphError;

/// Required Vulkan API version.
/// On macOS with MoltenVK, only Vulkan 1.2 is supported.
#[cfg(target_os = "macos")]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

#[cfg(not(target_os = "macos"))]
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Owns the instance, logical device and the single graphics+compute queue
/// every graph submission goes through.
pub struct DeviceContext {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    destroyed: bool,
}

impl DeviceContext {
    /// Create a surface-free context on the best available GPU.
    pub fn headless() -> Result<Self, GraphError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphError::InitializationFailed(format!("failed to load Vulkan library: {e}"))
        })?;

        let instance = create_instance(&entry)?;

        let physical_device = match select_physical_device(&instance) {
            Ok(pd) => pd,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let queue_family_index = match find_queue_family(&instance, physical_device) {
            Some(index) => index,
            None => {
                unsafe { instance.destroy_instance(None) };
                return Err(GraphError::InitializationFailed(
                    "no graphics+compute queue family found".to_string(),
                ));
            }
        };

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let queue_infos = [queue_info];

        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);

        let device =
            match unsafe { instance.create_device(physical_device, &device_info, None) } {
                Ok(device) => device,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(GraphError::InitializationFailed(format!(
                        "failed to create logical device: {e:?}"
                    )));
                }
            };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            memory_properties,
            destroyed: false,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Find a memory type index matching the requirement bits and the
    /// requested property flags.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32, GraphError> {
        for i in 0..self.memory_properties.memory_type_count {
            let supported = type_bits & (1 << i) != 0;
            let flags = self.memory_properties.memory_types[i as usize].property_flags;
            if supported && flags.contains(properties) {
                return Ok(i);
            }
        }
        Err(GraphError::InitializationFailed(format!(
            "no memory type matches bits {type_bits:#x} with {properties:?}"
        )))
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory), GraphError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| GraphError::device("vkCreateBuffer", e))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let memory_type = match self.find_memory_type(requirements.memory_type_bits, properties) {
            Ok(index) => index,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GraphError::device("vkAllocateMemory", e));
            }
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(GraphError::device("vkBindBufferMemory", e));
        }

        Ok((buffer, memory))
    }

    /// Block until the queue and device are idle.
    pub fn wait_idle(&self) -> Result<(), GraphError> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| GraphError::device("vkDeviceWaitIdle", e))
    }

    /// Destroy the logical device and instance. Must be called after every
    /// executor and element owning device resources has been destroyed.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        self.destroyed = true;
        log::debug!("Device context destroyed");
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("DeviceContext dropped without explicit destroy() call");
        }
    }
}

fn create_instance(entry: &ash::Entry) -> Result<ash::Instance, GraphError> {
    let app_name = CString::new("Amaranth").map_err(|e| {
        GraphError::InitializationFailed(format!("invalid application name: {e}"))
    })?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    #[allow(unused_mut)]
    let mut extensions: Vec<*const i8> = Vec::new();

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphError::InitializationFailed(format!("failed to create Vulkan instance: {e:?}"))
    })
}

/// Pick the highest-scoring physical device that has a usable queue family.
fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, GraphError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphError::InitializationFailed(format!("failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(GraphError::InitializationFailed(
            "no Vulkan physical devices found".to_string(),
        ));
    }

    let mut best: Option<(vk::PhysicalDevice, u32)> = None;

    for &device in &devices {
        if find_queue_family(instance, device).is_none() {
            continue;
        }

        let properties = unsafe { instance.get_physical_device_properties(device) };
        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 250,
            vk::PhysicalDeviceType::CPU => 100,
            _ => 10,
        };

        if best.map_or(true, |(_, s)| score > s) {
            best = Some((device, score));
        }
    }

    match best {
        Some((device, _)) => {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
            log::info!("Selected physical device: {}", name.to_string_lossy());
            Ok(device)
        }
        None => Err(GraphError::InitializationFailed(
            "no physical device with a graphics+compute queue family".to_string(),
        )),
    }
}

fn find_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .position(|f| f.queue_flags.contains(wanted))
        .map(|i| i as u32)
}

/// A buffer with its backing memory, created through
/// [`DeviceContext::create_buffer`]. Host-visible buffers support typed
/// reads and writes through a transient mapping.
pub struct DeviceBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    host_visible: bool,
}

impl DeviceBuffer {
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self, GraphError> {
        let (buffer, memory) = ctx.create_buffer(size, usage, properties)?;
        Ok(Self {
            buffer,
            memory,
            size,
            host_visible: properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        })
    }

    /// Shorthand for a host-visible, host-coherent storage buffer that can
    /// also be a transfer source and destination.
    pub fn host_storage(ctx: &DeviceContext, size: vk::DeviceSize) -> Result<Self, GraphError> {
        Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::INDIRECT_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Map the memory for the duration of the call. The buffer must be
    /// host-visible.
    pub fn map(&self, ctx: &DeviceContext) -> Result<*mut u8, GraphError> {
        if !self.host_visible {
            return Err(GraphError::InvalidUsage {
                element: "buffer".to_string(),
                reason: "memory is not host visible".to_string(),
            });
        }
        let ptr = unsafe {
            ctx.device()
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| GraphError::device("vkMapMemory", e))?;
        Ok(ptr as *mut u8)
    }

    pub fn unmap(&self, ctx: &DeviceContext) {
        unsafe { ctx.device().unmap_memory(self.memory) };
    }

    /// Copy `data` into the buffer starting at byte offset 0.
    pub fn write_bytes(&self, ctx: &DeviceContext, data: &[u8]) -> Result<(), GraphError> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(GraphError::InvalidUsage {
                element: "buffer".to_string(),
                reason: format!("write of {} bytes exceeds size {}", data.len(), self.size),
            });
        }
        let ptr = self.map(ctx)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        self.unmap(ctx);
        Ok(())
    }

    /// Copy the first `len` bytes of the buffer out to a vector.
    pub fn read_bytes(&self, ctx: &DeviceContext, len: usize) -> Result<Vec<u8>, GraphError> {
        if len as vk::DeviceSize > self.size {
            return Err(GraphError::InvalidUsage {
                element: "buffer".to_string(),
                reason: format!("read of {} bytes exceeds size {}", len, self.size),
            });
        }
        let ptr = self.map(ctx)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len);
        }
        self.unmap(ctx);
        Ok(out)
    }

    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            ctx.device().destroy_buffer(self.buffer, None);
            ctx.device().free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}
