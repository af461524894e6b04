use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::detect::{round_to, PpeClass, PpeDetector};
use crate::error::ServiceError;
use crate::records::{
    Alert, AlertStatus, Detection, DetectionFilter, DetectionStats, NewAlert, NewDetection,
    NewZone, Page, Zone, ZoneUpdate,
};
use crate::storage::DetectionStore;
use crate::uploads::{write_jpeg, UploadStore};

/// Detection pipeline and read-side aggregation over one store.
///
/// Write operations take `&mut self`, so a service instance processes one
/// request at a time. The detector is shared by handle.
pub struct DetectionService {
    store: Box<dyn DetectionStore>,
    detector: Arc<PpeDetector>,
    uploads: UploadStore,
}

impl DetectionService {
    pub fn new(
        store: Box<dyn DetectionStore>,
        detector: Arc<PpeDetector>,
        uploads: UploadStore,
    ) -> Self {
        Self {
            store,
            detector,
            uploads,
        }
    }

    pub fn detector(&self) -> &PpeDetector {
        &self.detector
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    /// Store an uploaded image, detect, annotate and persist the result.
    ///
    /// The original stays on disk even if decoding or detection fails. Alerts
    /// are raised once per distinct violation; a failure to persist them is
    /// logged and the detection is still returned.
    pub fn process(
        &mut self,
        image_bytes: &[u8],
        original_filename: &str,
        user_id: Option<i64>,
        zone_id: Option<i64>,
    ) -> Result<Detection, ServiceError> {
        if image_bytes.is_empty() {
            return Err(ServiceError::InvalidInput("empty image upload".to_string()));
        }
        if let Some(zone_id) = zone_id {
            match self.store.zone(zone_id)? {
                Some(zone) if zone.is_active => {}
                _ => return Err(ServiceError::not_found("zone", zone_id)),
            }
        }

        let upload = self.uploads.save_original(image_bytes, original_filename)?;
        let image = PpeDetector::decode(image_bytes)?;
        let result = self.detector.detect(&image)?;

        let annotated = self.detector.draw(&image, &result.detected_objects);
        let result_path = self.uploads.annotated_path(&upload);
        write_jpeg(&result_path, &annotated)?;

        let detection = self.store.insert_detection(NewDetection {
            user_id,
            zone_id,
            original_image_path: path_string(&upload.path),
            result_image_path: Some(path_string(&result_path)),
            result,
        })?;

        if detection.has_violation {
            let alerts = detection
                .violations
                .iter()
                .map(|&kind| NewAlert::for_violation(detection.id, kind))
                .collect();
            if let Err(err) = self.store.insert_alerts(alerts) {
                log::error!(
                    "failed to raise alerts for detection {}: {:#}",
                    detection.id,
                    err
                );
            }
        }

        log::info!(
            "detection {} stored: {} objects, {} persons, {} violations",
            detection.id,
            detection.detected_objects.len(),
            detection.person_count,
            detection.violation_count
        );
        Ok(detection)
    }

    pub fn get(&self, id: i64) -> Result<Option<Detection>, ServiceError> {
        Ok(self.store.detection(id)?)
    }

    /// Filtered history, newest first. `total` counts the filtered set.
    pub fn list(
        &self,
        filter: &DetectionFilter,
        page: Page,
    ) -> Result<(Vec<Detection>, u64), ServiceError> {
        Ok(self.store.list_detections(filter, page)?)
    }

    pub fn stats(&self, zone_id: Option<i64>) -> Result<DetectionStats, ServiceError> {
        let totals = self.store.detection_totals(zone_id)?;

        let compliance_rate = if totals.persons > 0 {
            let compliant = totals.persons as f64 - totals.violations as f64;
            round_to(compliant / totals.persons as f64 * 100.0, 2)
        } else {
            0.0
        };

        let mut violation_by_type = BTreeMap::new();
        for violations in self.store.violation_sets(zone_id)? {
            for kind in violations {
                *violation_by_type.entry(kind).or_insert(0u64) += 1;
            }
        }

        Ok(DetectionStats {
            total_detections: totals.detections,
            total_persons: totals.persons,
            total_violations: totals.violations,
            compliance_rate,
            violation_by_type,
        })
    }

    /// Encoded annotated image for a detection.
    pub fn result_image(&self, detection_id: i64) -> Result<Vec<u8>, ServiceError> {
        let detection = self.require_detection(detection_id)?;
        let path = detection
            .result_image_path
            .ok_or_else(|| ServiceError::not_found("result image", detection_id))?;
        match self.uploads.read(Path::new(&path)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::not_found("result image", detection_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn alerts_for_detection(&self, detection_id: i64) -> Result<Vec<Alert>, ServiceError> {
        self.require_detection(detection_id)?;
        Ok(self.store.alerts_for_detection(detection_id)?)
    }

    pub fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        page: Page,
    ) -> Result<(Vec<Alert>, u64), ServiceError> {
        Ok(self.store.list_alerts(status, page)?)
    }

    pub fn acknowledge(&mut self, alert_id: i64, actor: i64) -> Result<Alert, ServiceError> {
        let mut alert = self.require_alert(alert_id)?;
        if alert.status != AlertStatus::New {
            return Err(ServiceError::InvalidTransition {
                id: alert_id,
                from: alert.status.as_str(),
                to: AlertStatus::Acknowledged.as_str(),
            });
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(actor);
        alert.acknowledged_at = Some(Utc::now());
        self.store.update_alert(&alert)?;
        log::info!("alert {} acknowledged by user {}", alert_id, actor);
        Ok(alert)
    }

    pub fn resolve(
        &mut self,
        alert_id: i64,
        actor: i64,
        note: Option<String>,
    ) -> Result<Alert, ServiceError> {
        let mut alert = self.require_alert(alert_id)?;
        if alert.status == AlertStatus::Resolved {
            return Err(ServiceError::InvalidTransition {
                id: alert_id,
                from: alert.status.as_str(),
                to: AlertStatus::Resolved.as_str(),
            });
        }
        alert.status = AlertStatus::Resolved;
        alert.resolved_by = Some(actor);
        alert.resolved_at = Some(Utc::now());
        alert.resolution_note = note;
        self.store.update_alert(&alert)?;
        log::info!("alert {} resolved by user {}", alert_id, actor);
        Ok(alert)
    }

    pub fn create_zone(&mut self, zone: NewZone) -> Result<Zone, ServiceError> {
        let zone = NewZone {
            name: validate_zone_name(&zone.name)?,
            description: zone.description,
            required_ppe: validate_required_ppe(zone.required_ppe)?,
        };
        Ok(self.store.insert_zone(zone)?)
    }

    pub fn get_zone(&self, id: i64) -> Result<Zone, ServiceError> {
        self.store
            .zone(id)?
            .ok_or_else(|| ServiceError::not_found("zone", id))
    }

    /// Active zones only.
    pub fn list_zones(&self) -> Result<Vec<Zone>, ServiceError> {
        Ok(self.store.list_zones()?)
    }

    pub fn update_zone(&mut self, id: i64, update: ZoneUpdate) -> Result<Zone, ServiceError> {
        let mut zone = self.get_zone(id)?;
        if let Some(name) = update.name {
            zone.name = validate_zone_name(&name)?;
        }
        if let Some(description) = update.description {
            zone.description = Some(description);
        }
        if let Some(required_ppe) = update.required_ppe {
            zone.required_ppe = validate_required_ppe(required_ppe)?;
        }
        if let Some(is_active) = update.is_active {
            zone.is_active = is_active;
        }
        zone.updated_at = Some(Utc::now());
        self.store.update_zone(&zone)?;
        Ok(zone)
    }

    /// Soft delete: the zone stays addressable by id but is no longer listed
    /// or accepted for new detections.
    pub fn deactivate_zone(&mut self, id: i64) -> Result<Zone, ServiceError> {
        self.update_zone(
            id,
            ZoneUpdate {
                is_active: Some(false),
                ..ZoneUpdate::default()
            },
        )
    }

    fn require_detection(&self, id: i64) -> Result<Detection, ServiceError> {
        self.store
            .detection(id)?
            .ok_or_else(|| ServiceError::not_found("detection", id))
    }

    fn require_alert(&self, id: i64) -> Result<Alert, ServiceError> {
        self.store
            .alert(id)?
            .ok_or_else(|| ServiceError::not_found("alert", id))
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn validate_zone_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(ServiceError::InvalidInput(
            "zone name must be 1-100 characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn validate_required_ppe(labels: Vec<String>) -> Result<Vec<String>, ServiceError> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim().to_lowercase();
        if !PpeClass::ALL.iter().any(|class| class.name() == label) {
            return Err(ServiceError::InvalidInput(format!(
                "unknown PPE label '{}'",
                label
            )));
        }
        if !out.contains(&label) {
            out.push(label);
        }
    }
    Ok(out)
}
