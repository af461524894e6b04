//! Persisted records and the query shapes used to read them back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::{DetectedObject, DetectionResult, ViolationKind};

/// A stored detection run. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: i64,
    pub user_id: Option<i64>,
    pub zone_id: Option<i64>,
    pub original_image_path: String,
    pub result_image_path: Option<String>,
    pub detected_objects: Vec<DetectedObject>,
    pub violations: BTreeSet<ViolationKind>,
    pub person_count: u32,
    pub violation_count: u32,
    pub has_violation: bool,
    pub processing_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// Detection fields known before the row is written.
#[derive(Clone, Debug)]
pub struct NewDetection {
    pub user_id: Option<i64>,
    pub zone_id: Option<i64>,
    pub original_image_path: String,
    pub result_image_path: Option<String>,
    pub result: DetectionResult,
}

impl NewDetection {
    pub(crate) fn into_detection(self, id: i64, created_at: DateTime<Utc>) -> Detection {
        Detection {
            id,
            user_id: self.user_id,
            zone_id: self.zone_id,
            original_image_path: self.original_image_path,
            result_image_path: self.result_image_path,
            detected_objects: self.result.detected_objects,
            violations: self.result.violations,
            person_count: self.result.person_count,
            violation_count: self.result.violation_count,
            has_violation: self.result.has_violation,
            processing_time_ms: self.result.processing_time_ms,
            created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(AlertStatus::New),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub detection_id: i64,
    pub alert_type: ViolationKind,
    pub message: String,
    pub status: AlertStatus,
    pub acknowledged_by: Option<i64>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewAlert {
    pub detection_id: i64,
    pub alert_type: ViolationKind,
    pub message: String,
}

impl NewAlert {
    pub fn for_violation(detection_id: i64, kind: ViolationKind) -> Self {
        Self {
            detection_id,
            alert_type: kind,
            message: kind.alert_message(),
        }
    }

    pub(crate) fn into_alert(self, id: i64, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id,
            detection_id: self.detection_id,
            alert_type: self.alert_type,
            message: self.message,
            status: AlertStatus::New,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            created_at,
        }
    }
}

/// A named area with a required-PPE policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub required_ppe: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewZone {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_ppe: Vec<String>,
}

/// Partial zone update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_ppe: Option<Vec<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionFilter {
    pub zone_id: Option<i64>,
    pub has_violation: Option<bool>,
}

impl DetectionFilter {
    pub fn matches(&self, detection: &Detection) -> bool {
        self.zone_id.map_or(true, |zone| detection.zone_id == Some(zone))
            && self
                .has_violation
                .map_or(true, |flag| detection.has_violation == flag)
    }
}

/// Offset pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub skip: u64,
    pub limit: u64,
}

impl Page {
    pub const DEFAULT_LIMIT: u64 = 20;

    pub fn new(skip: u64, limit: u64) -> Self {
        Self { skip, limit }
    }

    /// 1-based page number with `per_page` items per page.
    pub fn numbered(page: u64, per_page: u64) -> Self {
        Self {
            skip: page.saturating_sub(1).saturating_mul(per_page),
            limit: per_page,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

/// Sum aggregates over a filtered set of detections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionTotals {
    pub detections: u64,
    pub persons: u64,
    pub violations: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_detections: u64,
    pub total_persons: u64,
    pub total_violations: u64,
    pub compliance_rate: f64,
    pub violation_by_type: BTreeMap<ViolationKind, u64>,
}
