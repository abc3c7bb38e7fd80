use serde::{Deserialize, Serialize};

use crate::app::{EstuaryError, Result};

/// A user-owned label. `(owner, value)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub owner: String,
    pub value: String,
}

impl Tag {
    pub fn new(owner: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(EstuaryError::InvalidInput("empty tag value".into()));
        }
        if owner.is_empty() {
            return Err(EstuaryError::InvalidInput("tag without owner".into()));
        }

        Ok(Self {
            id: 0,
            owner: owner.to_string(),
            value: value.to_string(),
        })
    }
}
