//! Configstore entities: the project tree, secrets and variables.
//!
//! Projects and project groups form a tree addressed by slash-separated
//! paths (`org/org01/projectgroup01/project01`). Secrets and variables
//! hang off any node of the tree; lookups walk from the node to the
//! root, deepest first.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use capstan_core::{ProjectGroupId, ProjectId, SecretId, VariableId};

use crate::when::When;

/// The kind of tree node an entity is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentKind {
    /// A project (a tree leaf).
    Project,
    /// A project group (an interior node).
    ProjectGroup,
}

/// Reference to the tree node an entity is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parent {
    /// Node kind.
    #[serde(rename = "type")]
    pub kind: ParentKind,
    /// Node id.
    pub id: String,
    /// Materialized node path. Filled by the configstore on reads;
    /// empty on write requests.
    #[serde(default)]
    pub path: String,
}

/// A project group: an interior node of the tree.
///
/// Root groups have no parent; their name carries the base path
/// (e.g. `org/org01`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectGroup {
    /// Unique id.
    pub id: ProjectGroupId,
    /// Name (one path component; base path for roots).
    pub name: String,
    /// Parent group, if not a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ProjectGroupId>,
}

/// A project: a leaf of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique id.
    pub id: ProjectId,
    /// Name (one path component).
    pub name: String,
    /// Owning project group.
    pub parent_id: ProjectGroupId,
}

/// Secret payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    /// Key-value payload stored in the configstore.
    Internal,
    /// Payload held by an external provider.
    External,
}

/// A secret. Unique by (parent id, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Unique id.
    pub id: SecretId,
    /// Name, unique within the parent.
    pub name: String,
    /// Payload kind.
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    /// Key-value payload for internal secrets.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
    /// Tree node the secret is attached to.
    pub parent: Parent,
}

/// One candidate value of a variable.
///
/// The first value whose `when` matches the trigger is selected; its
/// secret reference is then resolved against the variable's scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    /// Name of the referenced secret.
    pub secret_name: String,
    /// Key inside the referenced secret's data.
    pub secret_var: String,
    /// Predicate selecting this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
}

/// A variable. Unique by (parent id, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Unique id.
    pub id: VariableId,
    /// Name, unique within the parent.
    pub name: String,
    /// Ordered candidate values.
    pub values: Vec<VariableValue>,
    /// Tree node the variable is attached to.
    pub parent: Parent,
}

/// Returns true if `ancestor` is an ancestor of or equal to `path`.
///
/// Comparison is component-wise on slash-separated paths: `P` is an
/// ancestor of `Q` iff `Q == P` or `Q` starts with `P + "/"`.
#[must_use]
pub fn is_ancestor_path(ancestor: &str, path: &str) -> bool {
    path == ancestor || path.starts_with(&format!("{ancestor}/"))
}

/// Validates an entity name: lowercase alphanumerics and dashes,
/// starting and ending with an alphanumeric.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_char) {
        return false;
    }
    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().last().unwrap_or('-');
    first != '-' && last != '-'
}
