use crate::store::SyncStore;
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

struct Inner {
    branches: Vec<Branch>,
    devices: Vec<Device>,
    users: Vec<User>,
    badges: Vec<Badge>,
    user_device_map: HashSet<(i64, i64)>,
    /// Keyed by (device_userid, device_serial).
    refs: HashMap<(String, String), DeviceUserRef>,
    events: Vec<AttendanceEvent>,
    raw_events: Vec<RawEvent>,
    next_id: i64,
}

impl Inner {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of `SyncStore` for tests and no-DB runs.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                branches: Vec::new(),
                devices: Vec::new(),
                users: Vec::new(),
                badges: Vec::new(),
                user_device_map: HashSet::new(),
                refs: HashMap::new(),
                events: Vec::new(),
                raw_events: Vec::new(),
                next_id: 0,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    // ── Branches / devices ──

    async fn add_branch(&self, name: &str, ip_range: &str) -> Result<Branch> {
        let mut w = self.inner.write().await;
        if w.branches.iter().any(|b| b.name == name) {
            return Err(anyhow!("branch name already exists: {name}"));
        }
        let branch = Branch {
            id: w.next(),
            name: name.to_string(),
            ip_range: ip_range.to_string(),
        };
        w.branches.push(branch.clone());
        Ok(branch)
    }

    async fn add_device(
        &self,
        branch_id: Option<i64>,
        name: &str,
        ip: &str,
        port: u16,
        serial: Option<&str>,
    ) -> Result<Device> {
        let mut w = self.inner.write().await;
        let device = Device {
            id: w.next(),
            branch_id,
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            serial: serial.map(str::to_string),
            last_seen: None,
        };
        w.devices.push(device.clone());
        Ok(device)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.read().await.devices.clone())
    }

    async fn devices_by_branch(&self, branch_id: i64) -> Result<Vec<Device>> {
        let r = self.inner.read().await;
        Ok(r.devices
            .iter()
            .filter(|d| d.branch_id == Some(branch_id))
            .cloned()
            .collect())
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let r = self.inner.read().await;
        Ok(r.devices.iter().find(|d| d.id == id).cloned())
    }

    async fn set_device_serial(&self, id: i64, serial: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let dev = w
            .devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("device not found: {id}"))?;
        dev.serial = Some(serial.to_string());
        Ok(())
    }

    async fn touch_device_last_seen(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut w = self.inner.write().await;
        let dev = w
            .devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("device not found: {id}"))?;
        dev.last_seen = Some(at);
        Ok(())
    }

    // ── Identity ──

    async fn badge_by_number(&self, badge_number: &str) -> Result<Option<Badge>> {
        let r = self.inner.read().await;
        Ok(r.badges
            .iter()
            .find(|b| b.badge_number == badge_number)
            .cloned())
    }

    async fn user_by_employee_code(&self, employee_code: &str) -> Result<Option<User>> {
        let r = self.inner.read().await;
        Ok(r.users
            .iter()
            .find(|u| u.employee_code == employee_code)
            .cloned())
    }

    async fn create_user(
        &self,
        branch_id: i64,
        full_name: &str,
        employee_code: &str,
    ) -> Result<User> {
        let mut w = self.inner.write().await;
        if w.users.iter().any(|u| u.employee_code == employee_code) {
            return Err(anyhow!("employee_code already exists: {employee_code}"));
        }
        let user = User {
            id: w.next(),
            branch_id,
            full_name: full_name.to_string(),
            employee_code: employee_code.to_string(),
        };
        w.users.push(user.clone());
        Ok(user)
    }

    async fn create_badge(&self, user_id: i64, badge_number: &str) -> Result<Badge> {
        let mut w = self.inner.write().await;
        if w.badges.iter().any(|b| b.badge_number == badge_number) {
            return Err(anyhow!("badge_number already exists: {badge_number}"));
        }
        let badge = Badge {
            id: w.next(),
            user_id,
            badge_number: badge_number.to_string(),
            status: "active".to_string(),
        };
        w.badges.push(badge.clone());
        Ok(badge)
    }

    async fn link_user_device(&self, user_id: i64, device_id: i64) -> Result<()> {
        let mut w = self.inner.write().await;
        w.user_device_map.insert((user_id, device_id));
        Ok(())
    }

    // ── Roster replica ──

    async fn device_user_ref(
        &self,
        device_userid: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>> {
        let r = self.inner.read().await;
        Ok(r.refs
            .get(&(device_userid.to_string(), device_serial.to_string()))
            .cloned())
    }

    async fn device_user_ref_any(&self, device_userid: &str) -> Result<Option<DeviceUserRef>> {
        let r = self.inner.read().await;
        Ok(r.refs
            .values()
            .find(|e| e.device_userid == device_userid)
            .cloned())
    }

    async fn device_user_ref_by_badge(
        &self,
        badge_number: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>> {
        let r = self.inner.read().await;
        Ok(r.refs
            .values()
            .find(|e| e.badge_number == badge_number && e.device_serial == device_serial)
            .cloned())
    }

    async fn refs_for_serial(&self, device_serial: &str) -> Result<Vec<DeviceUserRef>> {
        let r = self.inner.read().await;
        Ok(r.refs
            .values()
            .filter(|e| e.device_serial == device_serial)
            .cloned()
            .collect())
    }

    async fn upsert_device_user_ref(&self, entry: &DeviceUserRef) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = (entry.device_userid.clone(), entry.device_serial.clone());

        if let Some(existing) = w.refs.get_mut(&key) {
            if existing.badge_number != entry.badge_number {
                existing.badge_number = entry.badge_number.clone();
            }
            if entry.name.is_some() && existing.name != entry.name {
                existing.name = entry.name.clone();
            }
            return Ok(());
        }

        // badge_number is globally unique; a racing writer wins and
        // the surviving row stands (rollback-and-reread semantics).
        let badge_taken = w
            .refs
            .values()
            .any(|e| e.badge_number == entry.badge_number);
        if badge_taken {
            return Ok(());
        }

        w.refs.insert(key, entry.clone());
        Ok(())
    }

    async fn prune_device_user_refs(&self, device_serial: &str, keep: &[String]) -> Result<u64> {
        let mut w = self.inner.write().await;
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let before = w.refs.len();
        w.refs
            .retain(|(userid, serial), _| serial != device_serial || keep.contains(userid.as_str()));
        Ok((before - w.refs.len()) as u64)
    }

    // ── Attendance events ──

    async fn existing_record_ids(&self, device_id: i64) -> Result<Vec<i64>> {
        let r = self.inner.read().await;
        Ok(r.events
            .iter()
            .filter(|e| e.device_id == device_id)
            .map(|e| e.record_id)
            .collect())
    }

    async fn commit_fetch(&self, device_id: i64, batch: &[StagedEvent]) -> Result<u64> {
        let mut w = self.inner.write().await;

        // Validate the whole batch before touching state so a
        // failure leaves no partial writes.
        let mut seen: HashSet<i64> = w
            .events
            .iter()
            .filter(|e| e.device_id == device_id)
            .map(|e| e.record_id)
            .collect();
        for staged in batch {
            if !seen.insert(staged.event.record_id) {
                return Err(anyhow!(
                    "duplicate record_id {} for device {device_id}",
                    staged.event.record_id
                ));
            }
        }

        for staged in batch {
            let id = w.next();
            let e = &staged.event;
            w.events.push(AttendanceEvent {
                id,
                device_id,
                record_id: e.record_id,
                user_id: e.user_id.clone(),
                device_userid: e.device_userid.clone(),
                badge_id: e.badge_id,
                timestamp: e.timestamp,
                status: e.status.clone(),
                exported: false,
                exported_at: None,
            });
            if let Some(raw) = &staged.raw {
                w.raw_events.push(RawEvent {
                    device_userid: raw.device_userid.clone(),
                    timestamp: raw.timestamp,
                    event_type: raw.event_type.clone(),
                    verify_code: 1,
                    sensor_id: "1".to_string(),
                    memo: None,
                    workcode: "0".to_string(),
                    device_serial: raw.device_serial.clone(),
                });
            }
        }
        Ok(batch.len() as u64)
    }

    async fn events_for_device(&self, device_id: i64) -> Result<Vec<AttendanceEvent>> {
        let r = self.inner.read().await;
        Ok(r.events
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn raw_events_for_serial(&self, device_serial: &str) -> Result<Vec<RawEvent>> {
        let r = self.inner.read().await;
        Ok(r.raw_events
            .iter()
            .filter(|e| e.device_serial == device_serial)
            .cloned()
            .collect())
    }

    // ── Export bookkeeping ──

    async fn unexported_events(
        &self,
        limit: usize,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<AttendanceEvent>> {
        let r = self.inner.read().await;
        let mut rows: Vec<AttendanceEvent> = r
            .events
            .iter()
            .filter(|e| !e.exported)
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_exported(&self, event_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut w = self.inner.write().await;
        let ev = w
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| anyhow!("event not found: {event_id}"))?;
        ev.exported = true;
        ev.exported_at = Some(at);
        Ok(())
    }
}
