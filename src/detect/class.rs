use serde::{Deserialize, Serialize};

/// Object classes produced by the PPE model, in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PpeClass {
    Hardhat,
    Mask,
    NoHardhat,
    NoMask,
    NoSafetyVest,
    Person,
    SafetyCone,
    SafetyVest,
    Machinery,
    Vehicle,
}

/// Missing-equipment classes. Each distinct kind in a detection raises one alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NoHardhat,
    NoMask,
    NoSafetyVest,
}

impl PpeClass {
    pub const ALL: [PpeClass; 10] = [
        PpeClass::Hardhat,
        PpeClass::Mask,
        PpeClass::NoHardhat,
        PpeClass::NoMask,
        PpeClass::NoSafetyVest,
        PpeClass::Person,
        PpeClass::SafetyCone,
        PpeClass::SafetyVest,
        PpeClass::Machinery,
        PpeClass::Vehicle,
    ];

    /// Resolve a model class index. Indices outside the table yield `None`.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u32 {
        match self {
            PpeClass::Hardhat => 0,
            PpeClass::Mask => 1,
            PpeClass::NoHardhat => 2,
            PpeClass::NoMask => 3,
            PpeClass::NoSafetyVest => 4,
            PpeClass::Person => 5,
            PpeClass::SafetyCone => 6,
            PpeClass::SafetyVest => 7,
            PpeClass::Machinery => 8,
            PpeClass::Vehicle => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PpeClass::Hardhat => "hardhat",
            PpeClass::Mask => "mask",
            PpeClass::NoHardhat => "no_hardhat",
            PpeClass::NoMask => "no_mask",
            PpeClass::NoSafetyVest => "no_safety_vest",
            PpeClass::Person => "person",
            PpeClass::SafetyCone => "safety_cone",
            PpeClass::SafetyVest => "safety_vest",
            PpeClass::Machinery => "machinery",
            PpeClass::Vehicle => "vehicle",
        }
    }

    pub fn violation(self) -> Option<ViolationKind> {
        match self {
            PpeClass::NoHardhat => Some(ViolationKind::NoHardhat),
            PpeClass::NoMask => Some(ViolationKind::NoMask),
            PpeClass::NoSafetyVest => Some(ViolationKind::NoSafetyVest),
            PpeClass::Hardhat
            | PpeClass::Mask
            | PpeClass::Person
            | PpeClass::SafetyCone
            | PpeClass::SafetyVest
            | PpeClass::Machinery
            | PpeClass::Vehicle => None,
        }
    }

    pub fn is_violation(self) -> bool {
        self.violation().is_some()
    }

    /// RGB stroke colour used when annotating.
    pub fn color(self) -> [u8; 3] {
        match self {
            PpeClass::Person => [0, 165, 255],
            PpeClass::Hardhat | PpeClass::SafetyVest | PpeClass::Mask => [0, 255, 0],
            PpeClass::NoHardhat | PpeClass::NoSafetyVest | PpeClass::NoMask => [255, 0, 0],
            PpeClass::SafetyCone => [0, 255, 255],
            PpeClass::Machinery | PpeClass::Vehicle => [128, 128, 128],
        }
    }
}

impl ViolationKind {
    pub fn label(self) -> &'static str {
        match self {
            ViolationKind::NoHardhat => "no_hardhat",
            ViolationKind::NoMask => "no_mask",
            ViolationKind::NoSafetyVest => "no_safety_vest",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "no_hardhat" => Some(ViolationKind::NoHardhat),
            "no_mask" => Some(ViolationKind::NoMask),
            "no_safety_vest" => Some(ViolationKind::NoSafetyVest),
            _ => None,
        }
    }

    /// Human-readable alert message for this violation.
    pub fn alert_message(self) -> String {
        format!("Detected: {}", self.label())
    }
}

impl std::fmt::Display for PpeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
