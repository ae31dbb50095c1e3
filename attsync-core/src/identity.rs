//! Content-addressed identity resolution: device-local user ids to
//! canonical badges, with optional auto-provisioning of minimal
//! users for badges the central model has never seen.

use crate::store::SyncStore;
use crate::types::Badge;
use anyhow::Result;

/// Resolve a canonical `Badge` for a device-local user id.
///
/// Order: roster ref for (device_userid, device_serial), roster ref
/// for device_userid on any serial, then the badge number directly.
pub async fn resolve_badge(
    store: &dyn SyncStore,
    device_userid: &str,
    device_serial: Option<&str>,
) -> Result<Option<Badge>> {
    if device_userid.is_empty() {
        return Ok(None);
    }

    if let Some(serial) = device_serial {
        if let Some(entry) = store.device_user_ref(device_userid, serial).await? {
            if let Some(badge) = store.badge_by_number(&entry.badge_number).await? {
                return Ok(Some(badge));
            }
        }
    }

    if let Some(entry) = store.device_user_ref_any(device_userid).await? {
        if let Some(badge) = store.badge_by_number(&entry.badge_number).await? {
            return Ok(Some(badge));
        }
    }

    store.badge_by_number(device_userid).await
}

/// Ensure a central `User` and `Badge` exist for `badge_number`,
/// linking the user to `device_id` when given. Creating a user
/// requires a branch; without one this returns `None` and the
/// caller treats the badge as unresolved.
///
/// Every step tolerates a concurrent creator: on a constraint
/// conflict the surviving row is re-read and used.
pub async fn ensure_user_and_badge(
    store: &dyn SyncStore,
    badge_number: &str,
    name: Option<&str>,
    branch_id: Option<i64>,
    device_id: Option<i64>,
    default_name: &str,
) -> Result<Option<Badge>> {
    let badge_number = badge_number.trim();
    if badge_number.is_empty() {
        return Ok(None);
    }

    if let Some(badge) = store.badge_by_number(badge_number).await? {
        return Ok(Some(badge));
    }

    let user = match store.user_by_employee_code(badge_number).await? {
        Some(user) => user,
        None => {
            let Some(branch_id) = branch_id else {
                return Ok(None);
            };
            let full_name = name.unwrap_or(default_name);
            match store.create_user(branch_id, full_name, badge_number).await {
                Ok(user) => user,
                // Lost the race; the winner's row is authoritative.
                Err(_) => match store.user_by_employee_code(badge_number).await? {
                    Some(user) => user,
                    None => return Ok(None),
                },
            }
        }
    };

    let badge = match store.create_badge(user.id, badge_number).await {
        Ok(badge) => badge,
        Err(_) => match store.badge_by_number(badge_number).await? {
            Some(badge) => badge,
            None => return Ok(None),
        },
    };

    if let Some(device_id) = device_id {
        if let Err(e) = store.link_user_device(user.id, device_id).await {
            tracing::warn!(error = %e, badge_number, "user-device link failed");
        }
    }

    Ok(Some(badge))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::DeviceUserRef;

    fn entry(userid: &str, badge: &str, serial: &str) -> DeviceUserRef {
        DeviceUserRef {
            device_userid: userid.to_string(),
            badge_number: badge.to_string(),
            name: None,
            device_serial: serial.to_string(),
            source: "device".to_string(),
        }
    }

    #[tokio::test]
    async fn resolves_through_serial_ref_first() {
        let store = MemoryStore::new();
        let branch = store.add_branch("HQ", "10.0.0.0/24").await.unwrap();
        let user = store.create_user(branch.id, "Alice", "E1").await.unwrap();
        store.create_badge(user.id, "B-100").await.unwrap();

        // Same device_userid points to different badges per serial.
        store
            .upsert_device_user_ref(&entry("7", "B-100", "SN-A"))
            .await
            .unwrap();
        store
            .upsert_device_user_ref(&entry("7", "B-OTHER", "SN-B"))
            .await
            .unwrap();

        let badge = resolve_badge(&store, "7", Some("SN-A")).await.unwrap();
        assert_eq!(badge.unwrap().badge_number, "B-100");
    }

    #[tokio::test]
    async fn falls_back_to_any_serial_then_direct_badge() {
        let store = MemoryStore::new();
        let branch = store.add_branch("HQ", "10.0.0.0/24").await.unwrap();
        let user = store.create_user(branch.id, "Bob", "E2").await.unwrap();
        store.create_badge(user.id, "B-200").await.unwrap();
        store
            .upsert_device_user_ref(&entry("9", "B-200", "SN-B"))
            .await
            .unwrap();

        // No ref for SN-A, but one for SN-B matches.
        let badge = resolve_badge(&store, "9", Some("SN-A")).await.unwrap();
        assert_eq!(badge.unwrap().badge_number, "B-200");

        // No ref at all: the userid itself is tried as a badge number.
        let direct = store.create_user(branch.id, "Cara", "300").await.unwrap();
        store.create_badge(direct.id, "300").await.unwrap();
        let badge = resolve_badge(&store, "300", Some("SN-A")).await.unwrap();
        assert_eq!(badge.unwrap().badge_number, "300");

        assert!(resolve_badge(&store, "999", Some("SN-A"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ensure_creates_user_badge_and_device_link() {
        let store = MemoryStore::new();
        let branch = store.add_branch("HQ", "10.0.0.0/24").await.unwrap();
        let device = store
            .add_device(Some(branch.id), "K40-1", "10.0.0.9", 4370, None)
            .await
            .unwrap();

        let badge = ensure_user_and_badge(
            &store,
            "555",
            None,
            Some(branch.id),
            Some(device.id),
            "IMPORTED",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(badge.badge_number, "555");

        let user = store.user_by_employee_code("555").await.unwrap().unwrap();
        assert_eq!(user.full_name, "IMPORTED");
        assert_eq!(user.id, badge.user_id);

        // Idempotent: the same badge comes back, nothing new created.
        let again = ensure_user_and_badge(&store, "555", None, Some(branch.id), None, "IMPORTED")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, badge.id);
    }

    #[tokio::test]
    async fn ensure_requires_branch_for_new_users() {
        let store = MemoryStore::new();
        let badge = ensure_user_and_badge(&store, "777", None, None, None, "IMPORTED")
            .await
            .unwrap();
        assert!(badge.is_none());
        assert!(store.user_by_employee_code("777").await.unwrap().is_none());
    }
}
