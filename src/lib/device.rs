//! # Devices
//!
//! A [`Device`] is a remote logical device plus its queues. Fences,
//! semaphores and queue submission hang off it (see `fence`, `semaphore`
//! and `queue`).
//!
//! Each queue gets a sync queue index so the renderer can order sync
//! signals per queue. Indices are handed out family by family, in the order
//! the families appear in [`DeviceCreateInfo`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::instance::{next_object_id, Instance};
use crate::protocol::{Command, QueueCreateInfo};
use crate::queue::Queue;

/// Queues to create along with the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCreateInfo {
    pub queue_families: Vec<QueueCreateInfo>,
}

impl DeviceCreateInfo {
    /// `queue_count` queues of a single family.
    pub fn single_family(family_index: u32, queue_count: u32) -> Self {
        Self {
            queue_families: vec![QueueCreateInfo {
                family_index,
                queue_count,
                flags: 0,
            }],
        }
    }
}

/// A logical device on the renderer.
pub struct Device {
    pub(crate) instance: Arc<Instance>,
    id: u64,
    queues: Vec<Queue>,
}

impl Device {
    pub fn new(instance: Arc<Instance>, info: &DeviceCreateInfo) -> Result<Device> {
        let id = next_object_id();
        let result = instance.call(&Command::CreateDevice {
            instance_id: instance.id(),
            device_id: id,
            queue_infos: info.queue_families.clone(),
        });
        instance.log_result("vkCreateDevice", result)?;

        let queues = match Self::init_queues(&instance, id, info) {
            Ok(queues) => queues,
            Err(err) => {
                if let Err(destroy_err) = instance.call(&Command::DestroyDevice { device_id: id }) {
                    warn!("failed to destroy device {}: {}", id, destroy_err);
                }
                return instance.log_result("vkCreateDevice", Err(err));
            }
        };

        debug!("device {} created with {} queues", id, queues.len());
        Ok(Device {
            instance,
            id,
            queues,
        })
    }

    /// On error the queues created so far are dropped.
    fn init_queues(
        instance: &Arc<Instance>,
        device_id: u64,
        info: &DeviceCreateInfo,
    ) -> Result<Vec<Queue>> {
        let max_sync_queues = instance.renderer_info().max_sync_queue_count;
        let total: u32 = info.queue_families.iter().map(|f| f.queue_count).sum();
        let mut queues = Vec::with_capacity(total as usize);

        let mut family_base = 0;
        for family in &info.queue_families {
            for index in 0..family.queue_count {
                let sync_queue_index = family_base + index;
                if sync_queue_index >= max_sync_queues {
                    return Err(Error::InitializationFailed(format!(
                        "renderer supports {} sync queues",
                        max_sync_queues
                    )));
                }
                queues.push(Queue::new(
                    Arc::clone(instance),
                    device_id,
                    family,
                    index,
                    sync_queue_index,
                )?);
            }
            family_base += family.queue_count;
        }
        Ok(queues)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Queue created without flags.
    pub fn queue(&self, family_index: u32, queue_index: u32) -> Option<&Queue> {
        self.queue2(family_index, queue_index, 0)
    }

    pub fn queue2(&self, family_index: u32, queue_index: u32, flags: u32) -> Option<&Queue> {
        self.queues.iter().find(|queue| {
            queue.family_index() == family_index
                && queue.index() == queue_index
                && queue.flags() == flags
        })
    }

    /// Wait until every queue of the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        for queue in &self.queues {
            queue.wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.queues.clear();
        if let Err(err) = self
            .instance
            .call_async(&Command::DestroyDevice { device_id: self.id })
        {
            warn!("failed to destroy device {}: {}", self.id, err);
        }
    }
}
