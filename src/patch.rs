//! JSON Patch Application
//!
//! RFC6902 add/remove/replace over a full deep clone. The working document
//! is never mutated in place; callers decide whether to keep the patched
//! clone, so a worse candidate can always be discarded.

use crate::error::EngineError;
use crate::pointer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One patch operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. } => path,
        }
    }
}

/// Parse a patch from its JSON array form, rejecting unsupported ops.
pub fn parse(value: &Value) -> Result<Vec<PatchOp>, EngineError> {
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::Patch(format!("malformed patch: {}", e)))
}

/// Apply a patch to a clone of the document and return the clone.
pub fn apply(document: &Value, ops: &[PatchOp]) -> Result<Value, EngineError> {
    let mut clone = document.clone();
    for op in ops {
        match op {
            PatchOp::Add { path, value } => {
                pointer::set(&mut clone, path, value.clone())?;
            }
            PatchOp::Remove { path } => {
                pointer::delete(&mut clone, path)?;
            }
            PatchOp::Replace { path, value } => {
                if pointer::get(&clone, path).is_none() {
                    return Err(EngineError::Patch(format!(
                        "replace target does not exist: {}",
                        path
                    )));
                }
                pointer::set(&mut clone, path, value.clone())?;
            }
        }
    }
    Ok(clone)
}
