//! Chip family strategy table.
//!
//! Every family-specific behaviour (virtual templates, network health,
//! node annotation keys) is looked up through [`ChipFamily::profile`]
//! instead of being spread over per-family types.

use std::fmt;
use std::str::FromStr;

use crate::domain::device::RESOURCE_NAME_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChipFamily {
    Ascend310,
    Ascend310P,
    Ascend910,
}

/// Static per-family behaviour.
#[derive(Debug)]
pub struct FamilyProfile {
    pub name: &'static str,
    /// Driver template name to core class, in ascending core order.
    pub templates: &'static [(&'static str, &'static str)],
    pub network_health: bool,
    pub device_ip: bool,
    pub pod_configuration_key: Option<&'static str>,
    pub unhealthy_key: &'static str,
    pub network_unhealthy_key: Option<&'static str>,
    pub recover_label: Option<&'static str>,
    pub network_recover_label: Option<&'static str>,
}

const PROFILES: [FamilyProfile; 3] = [
    FamilyProfile {
        name: "Ascend310",
        templates: &[],
        network_health: false,
        device_ip: false,
        pod_configuration_key: None,
        unhealthy_key: "huawei.com/Ascend310-Unhealthy",
        network_unhealthy_key: None,
        recover_label: None,
        network_recover_label: None,
    },
    FamilyProfile {
        name: "Ascend310P",
        templates: &[
            ("vir01", "1c"),
            ("vir02", "2c"),
            ("vir02_1c", "2c.1cpu"),
            ("vir04", "4c"),
            ("vir04_3c", "4c.3cpu"),
        ],
        network_health: false,
        device_ip: false,
        pod_configuration_key: Some("ascend.kubectl.kubernetes.io/ascend-310P-configuration"),
        unhealthy_key: "huawei.com/Ascend310P-Unhealthy",
        network_unhealthy_key: None,
        recover_label: None,
        network_recover_label: None,
    },
    FamilyProfile {
        name: "Ascend910",
        templates: &[
            ("vir02", "2c"),
            ("vir04", "4c"),
            ("vir08", "8c"),
            ("vir16", "16c"),
        ],
        network_health: true,
        device_ip: true,
        pod_configuration_key: Some("ascend.kubectl.kubernetes.io/ascend-910-configuration"),
        unhealthy_key: "huawei.com/Ascend910-Unhealthy",
        network_unhealthy_key: Some("huawei.com/Ascend910-NetworkUnhealthy"),
        recover_label: Some("huawei.com/Ascend910-Recover"),
        network_recover_label: Some("huawei.com/Ascend910-NetworkRecover"),
    },
];

impl ChipFamily {
    pub const ALL: [ChipFamily; 3] = [
        ChipFamily::Ascend310,
        ChipFamily::Ascend310P,
        ChipFamily::Ascend910,
    ];

    pub fn profile(self) -> &'static FamilyProfile {
        &PROFILES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }

    /// Map a driver chip name (e.g. `910B`, `310P3`) to its family.
    pub fn detect(chip_name: &str) -> Option<Self> {
        let upper = chip_name.to_ascii_uppercase();
        if upper.contains("910") {
            Some(ChipFamily::Ascend910)
        } else if upper.contains("310P") {
            Some(ChipFamily::Ascend310P)
        } else if upper.contains("310") {
            Some(ChipFamily::Ascend310)
        } else {
            None
        }
    }

    pub fn supports_virtual(self) -> bool {
        !self.profile().templates.is_empty()
    }

    pub fn core_classes(self) -> impl Iterator<Item = &'static str> {
        self.profile().templates.iter().map(|(_, class)| *class)
    }

    pub fn class_for_template(self, template: &str) -> Option<&'static str> {
        self.profile()
            .templates
            .iter()
            .find(|(name, _)| *name == template)
            .map(|(_, class)| *class)
    }

    pub fn template_for_class(self, class: &str) -> Option<&'static str> {
        self.profile()
            .templates
            .iter()
            .find(|(_, c)| *c == class)
            .map(|(name, _)| *name)
    }

    /// The bare family type plus one type per virtual core class.
    pub fn device_types(self) -> Vec<String> {
        std::iter::once(self.name().to_string())
            .chain(self.core_classes().map(|c| self.virtual_type(c)))
            .collect()
    }

    pub fn virtual_type(self, core_class: &str) -> String {
        format!("{}-{core_class}", self.name())
    }

    /// Node annotation key carrying the free devices of `device_type`.
    pub fn annotation_key(device_type: &str) -> String {
        format!("{RESOURCE_NAME_PREFIX}{device_type}")
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChipFamily::ALL
            .into_iter()
            .find(|family| family.name() == s)
            .ok_or(())
    }
}
