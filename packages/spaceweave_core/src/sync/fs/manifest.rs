use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::disk;
use super::layout::SpaceLayout;
use crate::sync::error::SyncError;

pub const MANIFEST_VERSION: u32 = 1;

/// Contents of `space.json`, identifying the space stored in a directory
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            id: space_id.into(),
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
        }
    }
}

pub async fn read_manifest(layout: &SpaceLayout) -> Result<Option<Manifest>, SyncError> {
    let Some(content) = disk::read_optional(&layout.manifest_path()).await? else {
        return Ok(None);
    };
    let manifest: Manifest = serde_json::from_str(&content)
        .map_err(|e| SyncError::SerializationError(format!("space.json: {}", e)))?;
    if manifest.version > MANIFEST_VERSION {
        return Err(SyncError::SerializationError(format!(
            "space.json version {} is newer than supported version {}",
            manifest.version, MANIFEST_VERSION
        )));
    }
    Ok(Some(manifest))
}

pub async fn write_manifest(layout: &SpaceLayout, manifest: &Manifest) -> Result<(), SyncError> {
    let data = serde_json::to_vec_pretty(manifest)
        .map_err(|e| SyncError::SerializationError(e.to_string()))?;
    disk::write_atomically(&layout.manifest_path(), &data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_round_trip_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(dir.path());

        assert_eq!(read_manifest(&layout).await.unwrap(), None);

        let manifest = Manifest::new("abc123");
        write_manifest(&layout, &manifest).await.unwrap();
        assert_eq!(read_manifest(&layout).await.unwrap(), Some(manifest));
    }

    #[tokio::test]
    async fn test_future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SpaceLayout::new(dir.path());
        std::fs::write(
            layout.manifest_path(),
            r#"{"id":"abc","version":99,"created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(read_manifest(&layout).await.is_err());
    }
}
