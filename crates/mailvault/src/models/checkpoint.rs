//! Provider-defined sync checkpoints
//!
//! A checkpoint is opaque to the coordinator. Gmail-style accounts keep a
//! history cursor; IMAP-style accounts keep a high-water UID per folder
//! together with the folder's UIDVALIDITY at the time it was recorded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest settled UID for one folder within one validity epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMark {
    pub uid: u32,
    pub validity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checkpoint {
    HistoryCursor { cursor: String },
    FolderUids { folders: BTreeMap<String, FolderMark> },
}

impl Checkpoint {
    pub fn cursor(cursor: impl Into<String>) -> Self {
        Checkpoint::HistoryCursor {
            cursor: cursor.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_mark_json_shape() {
        let mark = FolderMark { uid: 42, validity: 7 };
        let json = serde_json::to_string(&mark).unwrap();
        assert_eq!(json, r#"{"uid":42,"validity":7}"#);
        assert_eq!(serde_json::from_str::<FolderMark>(&json).unwrap(), mark);
    }
}
