//! Device classes bind an abstract storage tier name to a concrete volume
//! group and creation policy. They are operator configuration, resolved on
//! every RPC from an atomically swapped snapshot so that a reload never
//! disturbs requests already in flight.

use serde::Deserialize;
use snafu::Snafu;
use std::sync::{Arc, RwLock};

use crate::config::Config;

/// Errors raised when resolving configuration at request time.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Device class {name} not found"))]
    DeviceClassNotFound { name: String },
    #[snafu(display("No default device class is configured"))]
    NoDefaultDeviceClass,
    #[snafu(display("Lvcreate option class {name} not found"))]
    OptionClassNotFound { name: String },
}

/// Whether volumes of a device class are allocated directly from the
/// volume group or provisioned from a thin pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClassType {
    #[default]
    Thick,
    Thin,
}

/// Thin pool binding of a thin device class.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ThinPoolConfig {
    /// Name of the thin pool LV inside the volume group.
    pub name: String,
    /// Multiplier applied to the pool's physical size when advertising
    /// free capacity.
    pub overprovision_ratio: f64,
}

/// An operator defined storage tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceClass {
    pub name: String,
    /// The volume group backing this class.
    pub volume_group: String,
    /// At most one class carries the default flag; it serves requests
    /// which do not name a device class.
    #[serde(default)]
    pub default: bool,
    #[serde(default, rename = "type")]
    pub class_type: DeviceClassType,
    /// Stripe count handed to lvcreate, 0 or absent for linear volumes.
    #[serde(default)]
    pub stripe: Option<u32>,
    /// Stripe size handed to lvcreate verbatim, e.g. "64k".
    #[serde(default)]
    pub stripe_size: Option<String>,
    /// Extra arguments appended to every lvcreate for this class.
    #[serde(default)]
    pub lvcreate_options: Vec<String>,
    /// Required when `type` is thin.
    #[serde(default)]
    pub thin_pool: Option<ThinPoolConfig>,
}

/// A named set of extra lvcreate arguments which a volume request may
/// attach to the base creation command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LvcreateOptionClass {
    pub name: String,
    pub options: Vec<String>,
}

/// Maps device class names to their configuration.
#[derive(Debug)]
pub struct DeviceClassManager {
    classes: Vec<DeviceClass>,
}

impl DeviceClassManager {
    pub fn new(classes: Vec<DeviceClass>) -> Self {
        Self { classes }
    }

    /// Resolve a device class by name; the empty name resolves to the
    /// default class.
    pub fn resolve(&self, name: &str) -> Result<&DeviceClass, Error> {
        if name.is_empty() {
            return self
                .classes
                .iter()
                .find(|class| class.default)
                .ok_or(Error::NoDefaultDeviceClass);
        }
        self.classes
            .iter()
            .find(|class| class.name == name)
            .ok_or_else(|| Error::DeviceClassNotFound {
                name: name.to_string(),
            })
    }

    /// All configured device classes.
    pub fn classes(&self) -> &[DeviceClass] {
        &self.classes
    }
}

/// Maps lvcreate option class names to their extra arguments.
#[derive(Debug)]
pub struct LvcreateOptionClassManager {
    classes: Vec<LvcreateOptionClass>,
}

impl LvcreateOptionClassManager {
    pub fn new(classes: Vec<LvcreateOptionClass>) -> Self {
        Self { classes }
    }

    /// Resolve an option class by name; the empty name means no extra
    /// options.
    pub fn resolve(&self, name: &str) -> Result<&[String], Error> {
        if name.is_empty() {
            return Ok(&[]);
        }
        self.classes
            .iter()
            .find(|class| class.name == name)
            .map(|class| class.options.as_slice())
            .ok_or_else(|| Error::OptionClassNotFound {
                name: name.to_string(),
            })
    }
}

/// One immutable view of the configured classes, shared by the RPCs that
/// started while it was current.
#[derive(Debug)]
pub struct Snapshot {
    pub device_classes: DeviceClassManager,
    pub option_classes: LvcreateOptionClassManager,
}

impl Snapshot {
    fn from_config(config: &Config) -> Self {
        Self {
            device_classes: DeviceClassManager::new(config.device_classes.clone()),
            option_classes: LvcreateOptionClassManager::new(config.lvcreate_option_classes.clone()),
        }
    }
}

/// Process wide registry of device and option classes, replaced wholesale
/// on configuration reload.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(Snapshot::from_config(config))),
        }
    }

    /// The current snapshot; holders keep reading it even across reloads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().unwrap().clone()
    }

    /// Swap in a new configuration.
    pub fn reload(&self, config: &Config) {
        *self.inner.write().unwrap() = Arc::new(Snapshot::from_config(config));
    }
}
