use serde::{Deserialize, Serialize};

use crate::domain::raw_event::SourceTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Payload published by the change trigger on every source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: SourceTable,
    pub operation: ChangeOperation,
}
