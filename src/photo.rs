//! Photo record and change-feed delta types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of device a photo was captured on. Display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Desktop,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
        }
    }

    /// Parse the value stored in the `device_type` column.
    ///
    /// Unknown tags fall back to `Desktop` so a foreign row never breaks a fetch.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("mobile") {
            Self::Mobile
        } else {
            Self::Desktop
        }
    }

    /// Resolve the device class from a user-agent string.
    pub fn from_user_agent(user_agent: &str) -> Self {
        if is_capture_capable(user_agent) {
            Self::Mobile
        } else {
            Self::Desktop
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the user agent belongs to a touch device with a camera
/// (phones and tablets).
pub fn is_capture_capable(user_agent: &str) -> bool {
    const MARKERS: [&str; 5] = ["mobile", "android", "iphone", "ipad", "ipod"];
    let ua = user_agent.to_ascii_lowercase();
    MARKERS.iter().any(|m| ua.contains(m))
}

/// A row of the `photos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Backend-assigned id; the reconciliation key.
    pub id: String,
    /// Storage key of the blob.
    pub file_path: String,
    /// Public locator of the blob.
    pub file_url: String,
    /// Creation time; collections are sorted newest first.
    pub created_at: DateTime<Utc>,
    pub device_type: DeviceType,
}

impl PhotoRecord {
    /// File extension of the stored blob, if the storage key has one.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some(ext)
    }
}

/// A change notification for one row of the `photos` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Insert(PhotoRecord),
    Update(PhotoRecord),
    Delete { id: String },
}

impl Delta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Self::Insert(_) => DeltaKind::Insert,
            Self::Update(_) => DeltaKind::Update,
            Self::Delete { .. } => DeltaKind::Delete,
        }
    }

    /// Id of the row the delta concerns.
    pub fn id(&self) -> &str {
        match self {
            Self::Insert(r) | Self::Update(r) => &r.id,
            Self::Delete { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Insert,
    Update,
    Delete,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Which delta kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventFilter {
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        delete: true,
    };

    /// Inserts and deletes only.
    pub const ARRIVALS_AND_REMOVALS: Self = Self {
        insert: true,
        update: false,
        delete: true,
    };

    pub fn accepts(&self, kind: DeltaKind) -> bool {
        match kind {
            DeltaKind::Insert => self.insert,
            DeltaKind::Update => self.update,
            DeltaKind::Delete => self.delete,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::ALL
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Build a record whose `created_at` is `secs` seconds after 2024-01-01.
    pub(crate) fn photo(id: &str, secs: i64) -> PhotoRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        PhotoRecord {
            id: id.to_string(),
            file_path: format!("photos/{id}.jpg"),
            file_url: format!("https://cdn.example.com/photos/{id}.jpg"),
            created_at: base + chrono::Duration::seconds(secs),
            device_type: DeviceType::Mobile,
        }
    }

    #[test]
    fn test_capture_capable_user_agents() {
        assert!(is_capture_capable(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"
        ));
        assert!(is_capture_capable("Mozilla/5.0 (Linux; Android 14; Pixel 8)"));
        assert!(is_capture_capable("Mozilla/5.0 (iPad; CPU OS 16_0)"));
        assert!(!is_capture_capable(
            "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/120.0"
        ));
        assert_eq!(
            DeviceType::from_user_agent("ANDROID tablet"),
            DeviceType::Mobile
        );
        assert_eq!(DeviceType::from_user_agent(""), DeviceType::Desktop);
    }

    #[test]
    fn test_record_json_uses_column_names() {
        let json = r#"{
            "id": "0b6f",
            "file_path": "photos/1700000000000-abc.jpg",
            "file_url": "https://x.supabase.co/storage/v1/object/public/photos/photos/1700000000000-abc.jpg",
            "created_at": "2024-01-01T10:00:00+00:00",
            "device_type": "mobile"
        }"#;
        let record: PhotoRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "0b6f");
        assert_eq!(record.device_type, DeviceType::Mobile);
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["device_type"], "mobile");
        assert!(value.get("file_path").is_some());
    }

    #[test]
    fn test_extension() {
        let mut record = photo("a", 0);
        assert_eq!(record.extension(), Some("jpg"));
        record.file_path = "photos/noext".into();
        assert_eq!(record.extension(), None);
        record.file_path = "photos/.hidden".into();
        assert_eq!(record.extension(), None);
    }

    #[test]
    fn test_event_filter() {
        let f = EventFilter::ARRIVALS_AND_REMOVALS;
        assert!(f.accepts(DeltaKind::Insert));
        assert!(!f.accepts(DeltaKind::Update));
        assert!(f.accepts(DeltaKind::Delete));
        assert!(EventFilter::default().accepts(DeltaKind::Update));
    }

    #[test]
    fn test_delta_id_and_kind() {
        let d = Delta::Delete { id: "x".into() };
        assert_eq!(d.id(), "x");
        assert_eq!(d.kind(), DeltaKind::Delete);
        assert_eq!(Delta::Insert(photo("y", 1)).kind().as_str(), "INSERT");
    }
}
