use byte_unit::Byte;
use serde::Deserialize;
use std::{collections::HashMap, fmt, str::FromStr};
use tracing::info;

/// A byte quantity parsed from a human friendly string such as "512",
/// "5Mi" or "1G". Decimal suffixes are powers of ten, the `i` variants
/// powers of two.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Quantity(i64);

impl Quantity {
    pub fn new(bytes: i64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> i64 {
        self.0
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty quantity".to_string());
        }
        // a negative quantity means "no minimum"; byte sizes carry no
        // sign, so it is peeled off before parsing the magnitude
        let (negative, magnitude) = match s.strip_prefix('-') {
            Some(magnitude) => (true, magnitude),
            None => (false, s),
        };
        if let Ok(byte) = Byte::from_str(magnitude) {
            let bytes = i64::try_from(byte.get_bytes())
                .map_err(|_| format!("quantity {s} overflows"))?;
            Ok(Quantity(if negative { -bytes } else { bytes }))
        } else {
            Err(format!("invalid quantity {s}"))
        }
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct QuantityVisitor;

        impl serde::de::Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte quantity such as 1024, \"5Mi\" or \"1G\"")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Quantity(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v).map(Quantity).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// The access type requested for a volume: the CSI `VolumeCapability`
/// distilled to what the sizing policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCapability {
    Block,
    Mount { fs_type: String },
}

/// Minimum sizes for block volumes and for each filesystem type.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AllocationSettings {
    pub filesystem: HashMap<String, Quantity>,
    pub block: Quantity,
}

/// Minimum allocation sizes, defaulted process-wide and overridable per
/// device class. A device class entry replaces the default wholesale.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MinimumAllocationSettings {
    pub default: AllocationSettings,
    pub device_classes: HashMap<String, AllocationSettings>,
}

impl MinimumAllocationSettings {
    /// The minimum size to allocate, decided by the first capability: the
    /// block minimum for block access, the filesystem-specific minimum
    /// for mount access. Unknown filesystems and negative quantities fall
    /// back to zero.
    pub fn minimum_allocation_size(
        &self,
        device_class: &str,
        capabilities: &[VolumeCapability],
    ) -> i64 {
        let Some(capability) = capabilities.first() else {
            return 0;
        };
        let settings = self
            .device_classes
            .get(device_class)
            .unwrap_or(&self.default);
        let quantity = match capability {
            VolumeCapability::Block => settings.block,
            VolumeCapability::Mount { fs_type } => settings
                .filesystem
                .get(fs_type)
                .copied()
                .unwrap_or_default(),
        };
        quantity.bytes().max(0)
    }

    /// Apply the configured minimum to a converted capacity request: the
    /// required size is raised to the minimum, the limit passes through.
    pub fn min_max(
        &self,
        required: i64,
        limit: i64,
        device_class: &str,
        capabilities: &[VolumeCapability],
    ) -> (i64, i64) {
        let minimum = self.minimum_allocation_size(device_class, capabilities);
        if minimum > required {
            info!(
                "required size {required} is less than the configured minimum, \
                 using {minimum} as the required size"
            );
            return (minimum, limit);
        }
        (required, limit)
    }
}
