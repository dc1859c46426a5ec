//! Device identity and the per-device record pushed to kubelet.

use std::fmt;
use std::str::FromStr;

use error_stack::Report;

use crate::domain::chip::ChipFamily;
use crate::domain::errors::IdentityFormatError;

pub const RESOURCE_NAME_PREFIX: &str = "huawei.com/";
/// Upper bound on devices in one container request.
pub const MAX_DEVICES_PER_REQUEST: usize = 64;
pub const MAX_VIRTUAL_DEVICES: usize = 128;
/// Device IP reported for virtual devices.
pub const LOOPBACK_DEVICE_IP: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }

    pub fn is_healthy(self) -> bool {
        self == Health::Healthy
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reversible device identity.
///
/// Physical devices are named `<family>-<phyID>`, virtual devices
/// `<family>-<coreClass>-<vDevID>-<phyID>` where the core class is `<n>c`
/// optionally followed by `.<m>cpu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Physical {
        family: ChipFamily,
        phy_id: u32,
    },
    Virtual {
        family: ChipFamily,
        core_class: String,
        vdev_id: u32,
        phy_id: u32,
    },
}

impl DeviceId {
    pub fn physical(family: ChipFamily, phy_id: u32) -> Self {
        DeviceId::Physical { family, phy_id }
    }

    pub fn family(&self) -> ChipFamily {
        match self {
            DeviceId::Physical { family, .. } | DeviceId::Virtual { family, .. } => *family,
        }
    }

    pub fn phy_id(&self) -> u32 {
        match self {
            DeviceId::Physical { phy_id, .. } | DeviceId::Virtual { phy_id, .. } => *phy_id,
        }
    }

    pub fn vdev_id(&self) -> Option<u32> {
        match self {
            DeviceId::Physical { .. } => None,
            DeviceId::Virtual { vdev_id, .. } => Some(*vdev_id),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, DeviceId::Virtual { .. })
    }

    /// Device type this ID is served under.
    pub fn device_type(&self) -> String {
        match self {
            DeviceId::Physical { family, .. } => family.name().to_string(),
            DeviceId::Virtual {
                family, core_class, ..
            } => family.virtual_type(core_class),
        }
    }

    /// The number used in the visible-devices env and in recover labels.
    pub fn short_id(&self) -> u32 {
        self.vdev_id().unwrap_or_else(|| self.phy_id())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Physical { family, phy_id } => write!(f, "{family}-{phy_id}"),
            DeviceId::Virtual {
                family,
                core_class,
                vdev_id,
                phy_id,
            } => write!(f, "{family}-{core_class}-{vdev_id}-{phy_id}"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = Report<IdentityFormatError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            Report::new(IdentityFormatError::Malformed {
                name: s.to_string(),
            })
        };
        let parts: Vec<&str> = s.split('-').collect();
        let family = parts
            .first()
            .and_then(|name| name.parse::<ChipFamily>().ok())
            .ok_or_else(|| {
                Report::new(IdentityFormatError::UnknownFamily {
                    name: s.to_string(),
                })
            })?;

        match parts.as_slice() {
            [_, phy] => Ok(DeviceId::Physical {
                family,
                phy_id: parse_decimal(phy).ok_or_else(malformed)?,
            }),
            [_, class, vdev, phy] if is_core_class(class) => Ok(DeviceId::Virtual {
                family,
                core_class: (*class).to_string(),
                vdev_id: parse_decimal(vdev).ok_or_else(malformed)?,
                phy_id: parse_decimal(phy).ok_or_else(malformed)?,
            }),
            _ => Err(malformed()),
        }
    }
}

/// Canonical unsigned decimal: digits only, no leading zeros.
pub(crate) fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// Matches `<n>c` or `<n>c.<m>cpu`.
pub(crate) fn is_core_class(s: &str) -> bool {
    let (cores, cpu) = match s.split_once('.') {
        Some((cores, cpu)) => (cores, Some(cpu)),
        None => (s, None),
    };
    let cores_ok = cores
        .strip_suffix('c')
        .and_then(parse_decimal)
        .is_some_and(|n| n > 0);
    let cpu_ok = cpu.is_none_or(|cpu| {
        cpu.strip_suffix("cpu")
            .and_then(parse_decimal)
            .is_some_and(|n| n > 0)
    });
    cores_ok && cpu_ok
}

/// Extract the `<n>c` core token from a free-form request such as
/// `Ascend910-4c` or `vir04`-style entries already mapped to classes.
pub(crate) fn core_token(s: &str) -> Option<String> {
    s.split(['-', '.'])
        .find(|part| part.strip_suffix('c').and_then(parse_decimal).is_some())
        .map(str::to_string)
}

/// One device as served to kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpuDevice {
    pub dev_type: String,
    pub id: DeviceId,
    pub health: Health,
    pub network_health: Health,
}

impl NpuDevice {
    pub fn new(id: DeviceId) -> Self {
        Self {
            dev_type: id.device_type(),
            id,
            health: Health::Healthy,
            network_health: Health::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn physical_and_virtual_names_round_trip() {
        let names = [
            "Ascend910-0",
            "Ascend910-15",
            "Ascend310-3",
            "Ascend310P-7",
            "Ascend910-2c-100-0",
            "Ascend910-16c-131-7",
            "Ascend310P-2c.1cpu-104-1",
            "Ascend310P-4c.3cpu-100-0",
        ];
        for name in names {
            let id: DeviceId = name.parse().expect("should parse valid name");
            assert_eq!(id.to_string(), name, "should reproduce {name}");
        }
    }

    #[test]
    fn parsed_virtual_id_exposes_fields() {
        let id: DeviceId = "Ascend910-4c-101-3".parse().expect("should parse");
        assert_eq!(
            id,
            DeviceId::Virtual {
                family: ChipFamily::Ascend910,
                core_class: "4c".to_string(),
                vdev_id: 101,
                phy_id: 3,
            }
        );
        assert_eq!(id.device_type(), "Ascend910-4c");
        assert_eq!(id.short_id(), 101, "should use vdev id as short id");
    }

    #[test]
    fn malformed_names_are_rejected() {
        let bad = [
            "",
            "Ascend910",
            "Ascend910-",
            "Ascend910-01",
            "Ascend910-+1",
            "Ascend910-x",
            "Ascend910-4c-100",
            "Ascend910-4-100-0",
            "Ascend910-0c-100-0",
            "Ascend910-4c-100-0-1",
            "GPU-0",
            "ascend910-0",
        ];
        for name in bad {
            assert!(name.parse::<DeviceId>().is_err(), "should reject {name:?}");
        }
    }

    #[test]
    fn unknown_family_is_reported_as_such() {
        let err = "Ascend999-0".parse::<DeviceId>().expect_err("should fail");
        assert!(matches!(
            err.current_context(),
            IdentityFormatError::UnknownFamily { .. }
        ));
    }

    #[test]
    fn core_token_extracts_plain_class() {
        assert_eq!(core_token("Ascend910-4c").as_deref(), Some("4c"));
        assert_eq!(core_token("2c.1cpu").as_deref(), Some("2c"));
        assert_eq!(core_token("Ascend910"), None);
    }
}
