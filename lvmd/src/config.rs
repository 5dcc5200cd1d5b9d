//! The lvmd configuration file, yaml formatted:
//!
//! ```yaml
//! socket-name: /run/lvmd/lvmd.sock
//! device-classes:
//!   - name: ssd
//!     default: true
//!     volume-group: myvg
//!     type: thick
//!     lvcreate-options: []
//! lvcreate-option-classes:
//!   - name: fast
//!     options: ["--wipesignatures", "n"]
//! ```
//!
//! The file is validated as a whole on load; a reload which fails
//! validation leaves the running configuration untouched.

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};
use std::{collections::HashSet, fs, path::Path};

use crate::device_class::{DeviceClass, DeviceClassType, LvcreateOptionClass};

/// Default Unix domain socket the daemon listens on.
pub const DEFAULT_SOCKET: &str = "/run/lvmd/lvmd.sock";

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Failed to read {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse {path}: {source}"))]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
    #[snafu(display("No device classes are configured"))]
    NoDeviceClasses,
    #[snafu(display("Device class {name} is defined more than once"))]
    DuplicateDeviceClass { name: String },
    #[snafu(display("More than one device class is marked default"))]
    MultipleDefaults,
    #[snafu(display("Exactly one device class must be marked default"))]
    MissingDefault,
    #[snafu(display("Device class {name}: type thin requires a thin-pool section"))]
    ThinPoolRequired { name: String },
    #[snafu(display("Device class {name}: thin-pool is only valid for type thin"))]
    ThinPoolForbidden { name: String },
    #[snafu(display(
        "Device class {name}: overprovision-ratio must be at least 1.0, got {ratio}"
    ))]
    OverprovisionRatio { name: String, ratio: f64 },
    #[snafu(display("Lvcreate option class {name} is defined more than once"))]
    DuplicateOptionClass { name: String },
}

fn default_socket_name() -> String {
    DEFAULT_SOCKET.to_string()
}

/// The daemon configuration.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Unix domain socket the gRPC server listens on.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    #[serde(default)]
    pub device_classes: Vec<DeviceClass>,
    #[serde(default)]
    pub lvcreate_option_classes: Vec<LvcreateOptionClass>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            device_classes: Vec::new(),
            lvcreate_option_classes: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate the configuration from a yaml file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&raw).context(YamlSnafu {
            path: path.display().to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the structural invariants of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.device_classes.is_empty(), NoDeviceClassesSnafu);

        let mut names = HashSet::new();
        let mut defaults = 0usize;
        for class in &self.device_classes {
            ensure!(
                names.insert(class.name.as_str()),
                DuplicateDeviceClassSnafu {
                    name: class.name.as_str()
                }
            );
            if class.default {
                defaults += 1;
            }
            match (class.class_type, &class.thin_pool) {
                (DeviceClassType::Thin, None) => {
                    return ThinPoolRequiredSnafu {
                        name: class.name.as_str(),
                    }
                    .fail();
                }
                (DeviceClassType::Thick, Some(_)) => {
                    return ThinPoolForbiddenSnafu {
                        name: class.name.as_str(),
                    }
                    .fail();
                }
                (DeviceClassType::Thin, Some(pool)) => {
                    ensure!(
                        pool.overprovision_ratio >= 1.0,
                        OverprovisionRatioSnafu {
                            name: class.name.as_str(),
                            ratio: pool.overprovision_ratio,
                        }
                    );
                }
                (DeviceClassType::Thick, None) => {}
            }
        }
        ensure!(defaults <= 1, MultipleDefaultsSnafu);
        ensure!(defaults == 1, MissingDefaultSnafu);

        let mut option_names = HashSet::new();
        for class in &self.lvcreate_option_classes {
            ensure!(
                option_names.insert(class.name.as_str()),
                DuplicateOptionClassSnafu {
                    name: class.name.as_str()
                }
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
socket-name: /var/run/lvmd/lvmd.sock
device-classes:
  - name: ssd
    default: true
    volume-group: myvg
    type: thick
    stripe: 0
    lvcreate-options: []
  - name: pooled
    volume-group: myvg
    type: thin
    thin-pool:
      name: pool0
      overprovision-ratio: 10.0
lvcreate-option-classes:
  - name: fast
    options: ["--wipesignatures", "n"]
"#;

    fn parse(raw: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(raw).unwrap();
        config.validate().map(|()| config)
    }

    #[test]
    fn parses_the_sample_configuration() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.socket_name, "/var/run/lvmd/lvmd.sock");
        assert_eq!(config.device_classes.len(), 2);

        let ssd = &config.device_classes[0];
        assert!(ssd.default);
        assert_eq!(ssd.class_type, DeviceClassType::Thick);
        assert_eq!(ssd.stripe, Some(0));

        let pooled = &config.device_classes[1];
        assert_eq!(pooled.class_type, DeviceClassType::Thin);
        let pool = pooled.thin_pool.as_ref().unwrap();
        assert_eq!(pool.name, "pool0");
        assert_eq!(pool.overprovision_ratio, 10.0);

        assert_eq!(config.lvcreate_option_classes[0].options.len(), 2);
    }

    #[test]
    fn socket_name_defaults() {
        let config = parse("device-classes:\n  - name: a\n    default: true\n    volume-group: vg0\n").unwrap();
        assert_eq!(config.socket_name, DEFAULT_SOCKET);
    }

    #[test]
    fn rejects_multiple_defaults() {
        let raw = r#"
device-classes:
  - name: a
    default: true
    volume-group: vg0
  - name: b
    default: true
    volume-group: vg1
"#;
        assert!(matches!(parse(raw), Err(ConfigError::MultipleDefaults)));
    }

    #[test]
    fn rejects_missing_default() {
        let raw = "device-classes:\n  - name: a\n    volume-group: vg0\n";
        assert!(matches!(parse(raw), Err(ConfigError::MissingDefault)));
    }

    #[test]
    fn rejects_duplicate_class_names() {
        let raw = r#"
device-classes:
  - name: a
    default: true
    volume-group: vg0
  - name: a
    volume-group: vg1
"#;
        assert!(matches!(
            parse(raw),
            Err(ConfigError::DuplicateDeviceClass { .. })
        ));
    }

    #[test]
    fn thin_requires_a_pool() {
        let raw = r#"
device-classes:
  - name: a
    default: true
    volume-group: vg0
    type: thin
"#;
        assert!(matches!(
            parse(raw),
            Err(ConfigError::ThinPoolRequired { .. })
        ));
    }

    #[test]
    fn thick_rejects_a_pool_section() {
        let raw = r#"
device-classes:
  - name: a
    default: true
    volume-group: vg0
    thin-pool:
      name: pool0
      overprovision-ratio: 2.0
"#;
        assert!(matches!(
            parse(raw),
            Err(ConfigError::ThinPoolForbidden { .. })
        ));
    }

    #[test]
    fn overprovision_ratio_must_be_at_least_one() {
        let raw = r#"
device-classes:
  - name: a
    default: true
    volume-group: vg0
    type: thin
    thin-pool:
      name: pool0
      overprovision-ratio: 0.5
"#;
        assert!(matches!(
            parse(raw),
            Err(ConfigError::OverprovisionRatio { .. })
        ));
    }

    #[test]
    fn no_device_classes_is_an_error() {
        assert!(matches!(
            parse("socket-name: /tmp/l.sock\n"),
            Err(ConfigError::NoDeviceClasses)
        ));
    }
}
