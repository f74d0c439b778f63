//! WAL actions: the atomic unit of mutation.
//!
//! A [`WriteWal`](crate::wal::DataManager::write_wal) call carries an
//! ordered list of actions, each putting or deleting one entity of one
//! data type. Payloads are JSON documents.

use serde::{Deserialize, Serialize};
use std::fmt;

use capstan_core::{Error, Result};

/// The kind of mutation an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create or replace the entity.
    Put,
    /// Remove the entity.
    Delete,
}

/// The persisted entity classes managed by the datamanager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// A project.
    Project,
    /// A project group.
    ProjectGroup,
    /// A secret.
    Secret,
    /// A variable.
    Variable,
    /// A run.
    Run,
    /// A run config.
    RunConfig,
    /// An executor task assignment.
    ExecutorTask,
}

impl DataType {
    /// Returns the stable string form used in keys and changegroups.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ProjectGroup => "projectgroup",
            Self::Secret => "secret",
            Self::Variable => "variable",
            Self::Run => "run",
            Self::RunConfig => "runconfig",
            Self::ExecutorTask => "executortask",
        }
    }

    /// All data types, in snapshot fold order.
    pub const ALL: [Self; 7] = [
        Self::Project,
        Self::ProjectGroup,
        Self::Secret,
        Self::Variable,
        Self::Run,
        Self::RunConfig,
        Self::ExecutorTask,
    ];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic mutation inside a WAL write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Put or delete.
    pub action_type: ActionType,
    /// The entity class.
    pub data_type: DataType,
    /// The entity id.
    pub id: String,
    /// The entity payload; present for puts, absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Action {
    /// Creates a put action from a serializable entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity cannot be serialized.
    pub fn put<T: Serialize>(data_type: DataType, id: impl Into<String>, entity: &T) -> Result<Self> {
        Ok(Self {
            action_type: ActionType::Put,
            data_type,
            id: id.into(),
            data: Some(serde_json::to_value(entity)?),
        })
    }

    /// Creates a delete action.
    #[must_use]
    pub fn delete(data_type: DataType, id: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Delete,
            data_type,
            id: id.into(),
            data: None,
        }
    }

    /// Validates the action shape.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an empty id or a put without payload.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::bad_request("action id required"));
        }
        if self.action_type == ActionType::Put && self.data.is_none() {
            return Err(Error::bad_request(format!(
                "put action for {} {} has no data",
                self.data_type, self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_strings_are_stable() {
        assert_eq!(DataType::ProjectGroup.as_str(), "projectgroup");
        assert_eq!(DataType::ExecutorTask.to_string(), "executortask");
        assert_eq!(
            serde_json::to_string(&DataType::RunConfig).expect("serialize"),
            "\"runconfig\""
        );
    }

    #[test]
    fn put_without_data_is_invalid() {
        let action = Action {
            action_type: ActionType::Put,
            data_type: DataType::Secret,
            id: "s1".into(),
            data: None,
        };
        assert!(action.validate().is_err());
    }

    #[test]
    fn action_roundtrips_through_json() {
        let action = Action::put(DataType::Secret, "s1", &serde_json::json!({"name": "x"}))
            .expect("action");
        let json = serde_json::to_string(&action).expect("serialize");
        let back: Action = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(action, back);
    }
}
