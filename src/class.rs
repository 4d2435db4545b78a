//! Class-device registry
//!
//! Devices are trait objects grouped by class (`"chardev"`, `"rtc"`, ...)
//! and looked up by name. A device is stored as `Arc<dyn Any>`; callers
//! downcast to the type the class is documented to hold.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use log::debug;
use spin::RwLock;

use crate::error::{Error, Result};

pub type ClassDevice = Arc<dyn Any + Send + Sync>;

struct DeviceClass {
    name: String,
    devices: Vec<(String, ClassDevice)>,
}

#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<Vec<DeviceClass>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&self, class: &str) -> Result {
        let mut classes = self.classes.write();
        if classes.iter().any(|c| c.name == class) {
            return Err(Error::Busy);
        }
        classes.push(DeviceClass {
            name: String::from(class),
            devices: Vec::new(),
        });
        debug!("class {} registered", class);
        Ok(())
    }

    /// Remove an empty class
    pub fn unregister_class(&self, class: &str) -> Result {
        let mut classes = self.classes.write();
        let pos = classes.iter().position(|c| c.name == class).ok_or(Error::NotAvail)?;
        if !classes[pos].devices.is_empty() {
            return Err(Error::Busy);
        }
        classes.remove(pos);
        Ok(())
    }

    pub fn register_device(&self, class: &str, name: &str, dev: ClassDevice) -> Result {
        let mut classes = self.classes.write();
        let c = classes.iter_mut().find(|c| c.name == class).ok_or(Error::NotAvail)?;
        if c.devices.iter().any(|(n, _)| n == name) {
            return Err(Error::Busy);
        }
        c.devices.push((String::from(name), dev));
        debug!("{}: device {} registered", class, name);
        Ok(())
    }

    pub fn unregister_device(&self, class: &str, name: &str) -> Result<ClassDevice> {
        let mut classes = self.classes.write();
        let c = classes.iter_mut().find(|c| c.name == class).ok_or(Error::NotAvail)?;
        let pos = c.devices.iter().position(|(n, _)| n == name).ok_or(Error::NotAvail)?;
        Ok(c.devices.remove(pos).1)
    }

    pub fn find_device(&self, class: &str, name: &str) -> Option<ClassDevice> {
        self.classes
            .read()
            .iter()
            .find(|c| c.name == class)?
            .devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }

    /// Typed lookup
    pub fn find<T: Any + Send + Sync>(&self, class: &str, name: &str) -> Option<Arc<T>> {
        self.find_device(class, name)?.downcast::<T>().ok()
    }

    /// Device names of `class` in registration order
    pub fn devices(&self, class: &str) -> Vec<String> {
        self.classes
            .read()
            .iter()
            .find(|c| c.name == class)
            .map(|c| c.devices.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    pub fn device_count(&self, class: &str) -> usize {
        self.classes
            .read()
            .iter()
            .find(|c| c.name == class)
            .map_or(0, |c| c.devices.len())
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }
}
