use crate::error::{Error, ErrorKind};
use crate::models::{ChunkId, FileVersion, Representation, VersionId};
use exn::{OptionExt, ResultExt};
use time::OffsetDateTime;

/// A `file_versions` row joined with its (optional) `deltas` row.
#[derive(sqlx::FromRow)]
pub(crate) struct VersionRow {
    pub(crate) id: i64,
    pub(crate) file_id: String,
    pub(crate) version_number: i64,
    pub(crate) is_snapshot: bool,
    pub(crate) content_hash: String,
    pub(crate) size: i64,
    pub(crate) mime: String,
    pub(crate) original_name: String,
    pub(crate) iv: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) base_version_id: Option<i64>,
    pub(crate) strategy: Option<String>,
    pub(crate) patch: Option<String>,
    pub(crate) patch_size: Option<i64>,
}

/// Snapshots carry their ordered chunk list, loaded by a separate query.
impl TryFrom<(VersionRow, Vec<ChunkId>)> for FileVersion {
    type Error = Error;
    fn try_from((row, chunks): (VersionRow, Vec<ChunkId>)) -> Result<Self, Self::Error> {
        let representation = if row.is_snapshot {
            Representation::Snapshot { chunks }
        } else {
            Representation::Delta {
                base_version_id: VersionId(row.base_version_id.ok_or_raise(|| ErrorKind::InvalidData("delta base"))?),
                strategy: row.strategy.ok_or_raise(|| ErrorKind::InvalidData("delta strategy"))?,
                patch: row.patch.ok_or_raise(|| ErrorKind::InvalidData("delta patch"))?,
                patch_size: row
                    .patch_size
                    .map(u64::try_from)
                    .transpose()
                    .or_raise(|| ErrorKind::InvalidData("patch size"))?
                    .ok_or_raise(|| ErrorKind::InvalidData("patch size"))?,
            }
        };
        Ok(Self {
            id: VersionId(row.id),
            file_id: row.file_id,
            version_number: u64::try_from(row.version_number).or_raise(|| ErrorKind::InvalidData("version number"))?,
            content_hash: row.content_hash,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("size"))?,
            mime: row.mime,
            original_name: row.original_name,
            iv: row.iv,
            created_at: OffsetDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("created at"))?,
            representation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_row() -> VersionRow {
        VersionRow {
            id: 1,
            file_id: "notes.md".to_string(),
            version_number: 1,
            is_snapshot: true,
            content_hash: "a".repeat(64),
            size: 12,
            mime: "text/markdown".to_string(),
            original_name: "notes.md".to_string(),
            iv: None,
            created_at: 1_700_000_000,
            base_version_id: None,
            strategy: None,
            patch: None,
            patch_size: None,
        }
    }

    #[test]
    fn test_snapshot_row() {
        let version = FileVersion::try_from((snapshot_row(), vec![ChunkId(3), ChunkId(1)])).unwrap();
        assert!(version.is_snapshot());
        assert_eq!(version.representation, Representation::Snapshot { chunks: vec![ChunkId(3), ChunkId(1)] });
        assert_eq!(version.base_version_id(), None);
    }

    #[test]
    fn test_delta_row() {
        let row = VersionRow {
            id: 2,
            version_number: 2,
            is_snapshot: false,
            base_version_id: Some(1),
            strategy: Some("unified-diff".to_string()),
            patch: Some("--- original\n+++ modified\n".to_string()),
            patch_size: Some(26),
            ..snapshot_row()
        };
        let version = FileVersion::try_from((row, vec![])).unwrap();
        assert!(!version.is_snapshot());
        assert_eq!(version.base_version_id(), Some(VersionId(1)));
    }

    #[test]
    fn test_delta_row_without_delta_columns() {
        let row = VersionRow { is_snapshot: false, ..snapshot_row() };
        let err = FileVersion::try_from((row, vec![])).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("delta base")));
    }
}
