use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::detect::ViolationKind;
use crate::records::{
    Alert, AlertStatus, Detection, DetectionFilter, DetectionTotals, NewAlert, NewDetection,
    NewZone, Page, Zone,
};

/// Persistence for detections, alerts and zones.
///
/// Detections are append-only. `insert_alerts` writes all of its alerts or
/// none of them.
pub trait DetectionStore: Send {
    fn insert_detection(&mut self, new: NewDetection) -> Result<Detection>;

    fn insert_alerts(&mut self, alerts: Vec<NewAlert>) -> Result<Vec<Alert>>;

    fn detection(&self, id: i64) -> Result<Option<Detection>>;

    /// Filtered detections, newest first, plus the size of the filtered set.
    fn list_detections(&self, filter: &DetectionFilter, page: Page)
        -> Result<(Vec<Detection>, u64)>;

    fn detection_totals(&self, zone_id: Option<i64>) -> Result<DetectionTotals>;

    /// Violation set of every detection matching `zone_id`.
    fn violation_sets(&self, zone_id: Option<i64>) -> Result<Vec<BTreeSet<ViolationKind>>>;

    fn alert(&self, id: i64) -> Result<Option<Alert>>;

    fn alerts_for_detection(&self, detection_id: i64) -> Result<Vec<Alert>>;

    /// Alerts newest first, optionally by status, plus the size of the filtered set.
    fn list_alerts(&self, status: Option<AlertStatus>, page: Page) -> Result<(Vec<Alert>, u64)>;

    /// Persist the mutable lifecycle fields of an existing alert.
    fn update_alert(&mut self, alert: &Alert) -> Result<()>;

    fn insert_zone(&mut self, zone: NewZone) -> Result<Zone>;

    fn zone(&self, id: i64) -> Result<Option<Zone>>;

    /// Active zones in id order.
    fn list_zones(&self) -> Result<Vec<Zone>>;

    fn update_zone(&mut self, zone: &Zone) -> Result<()>;
}

/// URI for a private shared-cache in-memory database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:ppe_watch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

const DETECTION_COLUMNS: &str = "id, user_id, zone_id, original_image_path, result_image_path, \
     objects_json, violations_json, person_count, violation_count, has_violation, \
     processing_time_ms, created_at";

const ALERT_COLUMNS: &str = "id, detection_id, alert_type, message, status, acknowledged_by, \
     acknowledged_at, resolved_by, resolved_at, resolution_note, created_at";

const ZONE_COLUMNS: &str =
    "id, name, description, required_ppe_json, is_active, created_at, updated_at";

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    /// Open (or create) the database at `db_path`. `":memory:"` opens a fresh
    /// shared-cache in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_db_connection(&db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS zones (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              description TEXT,
              required_ppe_json TEXT NOT NULL DEFAULT '[]',
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at TEXT NOT NULL,
              updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER,
              zone_id INTEGER,
              original_image_path TEXT NOT NULL,
              result_image_path TEXT,
              objects_json TEXT NOT NULL DEFAULT '[]',
              violations_json TEXT NOT NULL DEFAULT '[]',
              person_count INTEGER NOT NULL DEFAULT 0,
              violation_count INTEGER NOT NULL DEFAULT 0,
              has_violation INTEGER NOT NULL DEFAULT 0,
              processing_time_ms REAL NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_id INTEGER NOT NULL REFERENCES detections(id),
              alert_type TEXT NOT NULL,
              message TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'new',
              acknowledged_by INTEGER,
              acknowledged_at TEXT,
              resolved_by INTEGER,
              resolved_at TEXT,
              resolution_note TEXT,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_zone ON detections(zone_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_detection ON alerts(detection_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
            "#,
        )?;
        Ok(())
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn violation_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<ViolationKind> {
    let raw: String = row.get(idx)?;
    ViolationKind::from_label(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown violation label '{}'", raw).into(),
        )
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<AlertStatus> {
    let raw: String = row.get(idx)?;
    AlertStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown alert status '{}'", raw).into(),
        )
    })
}

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    Ok(Detection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        zone_id: row.get(2)?,
        original_image_path: row.get(3)?,
        result_image_path: row.get(4)?,
        detected_objects: json_column(row, 5)?,
        violations: json_column(row, 6)?,
        person_count: row.get(7)?,
        violation_count: row.get(8)?,
        has_violation: row.get(9)?,
        processing_time_ms: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        alert_type: violation_column(row, 2)?,
        message: row.get(3)?,
        status: status_column(row, 4)?,
        acknowledged_by: row.get(5)?,
        acknowledged_at: row.get(6)?,
        resolved_by: row.get(7)?,
        resolved_at: row.get(8)?,
        resolution_note: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn zone_from_row(row: &Row<'_>) -> rusqlite::Result<Zone> {
    Ok(Zone {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        required_ppe: json_column(row, 3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn count_to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative aggregate from database: {}", value))
}

impl DetectionStore for SqliteDetectionStore {
    fn insert_detection(&mut self, new: NewDetection) -> Result<Detection> {
        let created_at = Utc::now();
        let objects_json = serde_json::to_string(&new.result.detected_objects)?;
        let violations_json = serde_json::to_string(&new.result.violations)?;

        self.conn.execute(
            r#"
            INSERT INTO detections(user_id, zone_id, original_image_path, result_image_path,
              objects_json, violations_json, person_count, violation_count, has_violation,
              processing_time_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                new.user_id,
                new.zone_id,
                new.original_image_path,
                new.result_image_path,
                objects_json,
                violations_json,
                new.result.person_count,
                new.result.violation_count,
                new.result.has_violation,
                new.result.processing_time_ms,
                created_at,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(new.into_detection(id, created_at))
    }

    fn insert_alerts(&mut self, alerts: Vec<NewAlert>) -> Result<Vec<Alert>> {
        let created_at = Utc::now();
        let tx = self.conn.transaction()?;
        let mut out = Vec::with_capacity(alerts.len());
        for alert in alerts {
            tx.execute(
                r#"
                INSERT INTO alerts(detection_id, alert_type, message, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    alert.detection_id,
                    alert.alert_type.label(),
                    alert.message,
                    AlertStatus::New.as_str(),
                    created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();
            out.push(alert.into_alert(id, created_at));
        }
        tx.commit()?;
        Ok(out)
    }

    fn detection(&self, id: i64) -> Result<Option<Detection>> {
        let sql = format!("SELECT {} FROM detections WHERE id = ?1", DETECTION_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], detection_from_row)
            .optional()?)
    }

    fn list_detections(
        &self,
        filter: &DetectionFilter,
        page: Page,
    ) -> Result<(Vec<Detection>, u64)> {
        const WHERE: &str = "WHERE (?1 IS NULL OR zone_id = ?1) AND (?2 IS NULL OR has_violation = ?2)";

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM detections {}", WHERE),
            params![filter.zone_id, filter.has_violation],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM detections {} ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4",
            DETECTION_COLUMNS, WHERE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                params![
                    filter.zone_id,
                    filter.has_violation,
                    i64::try_from(page.limit).unwrap_or(i64::MAX),
                    i64::try_from(page.skip).unwrap_or(i64::MAX),
                ],
                detection_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((items, count_to_u64(total)?))
    }

    fn detection_totals(&self, zone_id: Option<i64>) -> Result<DetectionTotals> {
        let (detections, persons, violations): (i64, i64, i64) = self.conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(person_count), 0), COALESCE(SUM(violation_count), 0)
            FROM detections WHERE (?1 IS NULL OR zone_id = ?1)
            "#,
            params![zone_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(DetectionTotals {
            detections: count_to_u64(detections)?,
            persons: count_to_u64(persons)?,
            violations: count_to_u64(violations)?,
        })
    }

    fn violation_sets(&self, zone_id: Option<i64>) -> Result<Vec<BTreeSet<ViolationKind>>> {
        let mut stmt = self.conn.prepare(
            "SELECT violations_json FROM detections WHERE (?1 IS NULL OR zone_id = ?1) ORDER BY id",
        )?;
        let sets = stmt
            .query_map(params![zone_id], |row| json_column(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sets)
    }

    fn alert(&self, id: i64) -> Result<Option<Alert>> {
        let sql = format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], alert_from_row)
            .optional()?)
    }

    fn alerts_for_detection(&self, detection_id: i64) -> Result<Vec<Alert>> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE detection_id = ?1 ORDER BY id",
            ALERT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let alerts = stmt
            .query_map(params![detection_id], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn list_alerts(&self, status: Option<AlertStatus>, page: Page) -> Result<(Vec<Alert>, u64)> {
        let status = status.map(AlertStatus::as_str);
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE (?1 IS NULL OR status = ?1)",
            params![status],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM alerts WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            ALERT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let alerts = stmt
            .query_map(
                params![
                    status,
                    i64::try_from(page.limit).unwrap_or(i64::MAX),
                    i64::try_from(page.skip).unwrap_or(i64::MAX),
                ],
                alert_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((alerts, count_to_u64(total)?))
    }

    fn update_alert(&mut self, alert: &Alert) -> Result<()> {
        let changed = self.conn.execute(
            r#"
            UPDATE alerts SET status = ?2, acknowledged_by = ?3, acknowledged_at = ?4,
              resolved_by = ?5, resolved_at = ?6, resolution_note = ?7
            WHERE id = ?1
            "#,
            params![
                alert.id,
                alert.status.as_str(),
                alert.acknowledged_by,
                alert.acknowledged_at,
                alert.resolved_by,
                alert.resolved_at,
                alert.resolution_note,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("alert {} does not exist", alert.id));
        }
        Ok(())
    }

    fn insert_zone(&mut self, zone: NewZone) -> Result<Zone> {
        let created_at = Utc::now();
        let required_ppe_json = serde_json::to_string(&zone.required_ppe)?;
        self.conn.execute(
            r#"
            INSERT INTO zones(name, description, required_ppe_json, is_active, created_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            "#,
            params![zone.name, zone.description, required_ppe_json, created_at],
        )?;
        Ok(Zone {
            id: self.conn.last_insert_rowid(),
            name: zone.name,
            description: zone.description,
            required_ppe: zone.required_ppe,
            is_active: true,
            created_at,
            updated_at: None,
        })
    }

    fn zone(&self, id: i64) -> Result<Option<Zone>> {
        let sql = format!("SELECT {} FROM zones WHERE id = ?1", ZONE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], zone_from_row)
            .optional()?)
    }

    fn list_zones(&self) -> Result<Vec<Zone>> {
        let sql = format!(
            "SELECT {} FROM zones WHERE is_active = 1 ORDER BY id",
            ZONE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let zones = stmt
            .query_map([], zone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(zones)
    }

    fn update_zone(&mut self, zone: &Zone) -> Result<()> {
        let required_ppe_json = serde_json::to_string(&zone.required_ppe)?;
        let changed = self.conn.execute(
            r#"
            UPDATE zones SET name = ?2, description = ?3, required_ppe_json = ?4,
              is_active = ?5, updated_at = ?6
            WHERE id = ?1
            "#,
            params![
                zone.id,
                zone.name,
                zone.description,
                required_ppe_json,
                zone.is_active,
                zone.updated_at,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("zone {} does not exist", zone.id));
        }
        Ok(())
    }
}

/// In-process store with the same ordering and filtering rules as the
/// SQLite store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    detections: Vec<Detection>,
    alerts: Vec<Alert>,
    zones: Vec<Zone>,
}

fn newest_first<T>(items: &mut [&T], key: impl Fn(&T) -> (DateTime<Utc>, i64)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn paginate<T: Clone>(items: &[&T], page: Page) -> Vec<T> {
    items
        .iter()
        .skip(usize::try_from(page.skip).unwrap_or(usize::MAX))
        .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
        .map(|item| (*item).clone())
        .collect()
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(len: usize) -> i64 {
        len as i64 + 1
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn insert_detection(&mut self, new: NewDetection) -> Result<Detection> {
        let detection = new.into_detection(Self::next_id(self.detections.len()), Utc::now());
        self.detections.push(detection.clone());
        Ok(detection)
    }

    fn insert_alerts(&mut self, alerts: Vec<NewAlert>) -> Result<Vec<Alert>> {
        if let Some(orphan) = alerts
            .iter()
            .find(|alert| !self.detections.iter().any(|d| d.id == alert.detection_id))
        {
            return Err(anyhow!(
                "alert references unknown detection {}",
                orphan.detection_id
            ));
        }
        let created_at = Utc::now();
        let mut out = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let alert = alert.into_alert(Self::next_id(self.alerts.len() + out.len()), created_at);
            out.push(alert);
        }
        self.alerts.extend(out.iter().cloned());
        Ok(out)
    }

    fn detection(&self, id: i64) -> Result<Option<Detection>> {
        Ok(self.detections.iter().find(|d| d.id == id).cloned())
    }

    fn list_detections(
        &self,
        filter: &DetectionFilter,
        page: Page,
    ) -> Result<(Vec<Detection>, u64)> {
        let mut matching: Vec<&Detection> =
            self.detections.iter().filter(|d| filter.matches(d)).collect();
        newest_first(&mut matching, |d| (d.created_at, d.id));
        Ok((paginate(&matching, page), matching.len() as u64))
    }

    fn detection_totals(&self, zone_id: Option<i64>) -> Result<DetectionTotals> {
        let filter = DetectionFilter {
            zone_id,
            has_violation: None,
        };
        Ok(self
            .detections
            .iter()
            .filter(|d| filter.matches(d))
            .fold(DetectionTotals::default(), |mut totals, d| {
                totals.detections += 1;
                totals.persons += u64::from(d.person_count);
                totals.violations += u64::from(d.violation_count);
                totals
            }))
    }

    fn violation_sets(&self, zone_id: Option<i64>) -> Result<Vec<BTreeSet<ViolationKind>>> {
        let filter = DetectionFilter {
            zone_id,
            has_violation: None,
        };
        Ok(self
            .detections
            .iter()
            .filter(|d| filter.matches(d))
            .map(|d| d.violations.clone())
            .collect())
    }

    fn alert(&self, id: i64) -> Result<Option<Alert>> {
        Ok(self.alerts.iter().find(|a| a.id == id).cloned())
    }

    fn alerts_for_detection(&self, detection_id: i64) -> Result<Vec<Alert>> {
        Ok(self
            .alerts
            .iter()
            .filter(|a| a.detection_id == detection_id)
            .cloned()
            .collect())
    }

    fn list_alerts(&self, status: Option<AlertStatus>, page: Page) -> Result<(Vec<Alert>, u64)> {
        let mut matching: Vec<&Alert> = self
            .alerts
            .iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect();
        newest_first(&mut matching, |a| (a.created_at, a.id));
        Ok((paginate(&matching, page), matching.len() as u64))
    }

    fn update_alert(&mut self, alert: &Alert) -> Result<()> {
        let slot = self
            .alerts
            .iter_mut()
            .find(|a| a.id == alert.id)
            .ok_or_else(|| anyhow!("alert {} does not exist", alert.id))?;
        *slot = alert.clone();
        Ok(())
    }

    fn insert_zone(&mut self, zone: NewZone) -> Result<Zone> {
        let zone = Zone {
            id: Self::next_id(self.zones.len()),
            name: zone.name,
            description: zone.description,
            required_ppe: zone.required_ppe,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.zones.push(zone.clone());
        Ok(zone)
    }

    fn zone(&self, id: i64) -> Result<Option<Zone>> {
        Ok(self.zones.iter().find(|z| z.id == id).cloned())
    }

    fn list_zones(&self) -> Result<Vec<Zone>> {
        Ok(self.zones.iter().filter(|z| z.is_active).cloned().collect())
    }

    fn update_zone(&mut self, zone: &Zone) -> Result<()> {
        let slot = self
            .zones
            .iter_mut()
            .find(|z| z.id == zone.id)
            .ok_or_else(|| anyhow!("zone {} does not exist", zone.id))?;
        *slot = zone.clone();
        Ok(())
    }
}
