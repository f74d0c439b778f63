//! Configstore action handlers.
//!
//! Every mutation captures its changegroup tokens and performs its
//! duplicate checks inside one ReadDB transaction, then commits
//! through the WAL; a concurrent conflicting mutation makes the
//! commit fail with `Conflict` instead of corrupting the tree.

use std::collections::HashMap;
use std::sync::Arc;

use capstan_core::{Error, ProjectGroupId, ProjectId, Result, SecretId, VariableId};
use capstan_datamanager::{id_group, name_group, Action, DataType, DataManager, ReadDb, ReadTx};

use crate::types::{
    is_valid_name, Parent, ParentKind, Project, ProjectGroup, Secret, SecretType, Variable,
    VariableValue,
};

/// Parent chains longer than this are treated as cyclic.
const MAX_PARENT_DEPTH: usize = 32;

/// Request to create a secret.
#[derive(Debug, Clone)]
pub struct CreateSecretRequest {
    /// Secret name, unique within the parent.
    pub name: String,
    /// Payload kind.
    pub secret_type: SecretType,
    /// Key-value payload for internal secrets.
    pub data: HashMap<String, String>,
    /// Tree node to attach the secret to (path ignored).
    pub parent: Parent,
}

/// Request to create a variable.
#[derive(Debug, Clone)]
pub struct CreateVariableRequest {
    /// Variable name, unique within the parent.
    pub name: String,
    /// Ordered candidate values.
    pub values: Vec<VariableValue>,
    /// Tree node to attach the variable to (path ignored).
    pub parent: Parent,
}

/// Configstore action handler.
#[derive(Clone)]
pub struct ActionHandler {
    dm: Arc<DataManager>,
    readdb: ReadDb,
}

impl ActionHandler {
    /// Creates an action handler over the datamanager and its ReadDB.
    #[must_use]
    pub fn new(dm: Arc<DataManager>, readdb: ReadDb) -> Self {
        Self { dm, readdb }
    }

    // ------------------------------------------------------------------
    // Project tree
    // ------------------------------------------------------------------

    /// Creates a project group.
    ///
    /// Root groups (`parent_id` = `None`) may carry a multi-component
    /// base path as their name (e.g. `org/org01`).
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid names, an unrooted parent chain or a
    /// duplicate name; `Conflict` on a concurrent create.
    pub async fn create_project_group(
        &self,
        name: &str,
        parent_id: Option<ProjectGroupId>,
    ) -> Result<ProjectGroup> {
        let valid = if parent_id.is_some() {
            is_valid_name(name)
        } else {
            !name.is_empty() && name.split('/').all(is_valid_name)
        };
        if !valid {
            return Err(Error::bad_request(format!(
                "invalid project group name {name:?}"
            )));
        }

        let group_name = change_group_for_child(
            DataType::ProjectGroup,
            parent_id.map(|id| id.to_string()).as_deref(),
            name,
        );

        let cgt = self.readdb.do_read(|tx| {
            let token = tx.change_group_tokens(&[group_name.clone()]);

            if let Some(parent) = parent_id {
                // The parent chain must reach a root; this also bounds
                // the walk against cyclic stored data.
                group_path(tx, parent)?;
            }
            let duplicate = tx
                .all_as::<ProjectGroup>(DataType::ProjectGroup)?
                .into_iter()
                .any(|g| g.parent_id == parent_id && g.name == name);
            if duplicate {
                return Err(Error::bad_request(format!(
                    "project group with name {name:?} already exists"
                )));
            }
            Ok(token)
        })?;

        let group = ProjectGroup {
            id: ProjectGroupId::generate(),
            name: name.to_string(),
            parent_id,
        };
        let seq = self
            .dm
            .write_wal(
                vec![Action::put(
                    DataType::ProjectGroup,
                    group.id.to_string(),
                    &group,
                )?],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(group)
    }

    /// Creates a project under a project group.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid names or a duplicate name; `NotFound`
    /// for a missing parent; `Conflict` on a concurrent create.
    pub async fn create_project(&self, name: &str, parent_id: ProjectGroupId) -> Result<Project> {
        if !is_valid_name(name) {
            return Err(Error::bad_request(format!("invalid project name {name:?}")));
        }

        let group_name = change_group_for_child(
            DataType::Project,
            Some(parent_id.to_string()).as_deref(),
            name,
        );

        let cgt = self.readdb.do_read(|tx| {
            let token = tx.change_group_tokens(&[group_name.clone()]);
            group_path(tx, parent_id)?;
            let duplicate = tx
                .all_as::<Project>(DataType::Project)?
                .into_iter()
                .any(|p| p.parent_id == parent_id && p.name == name);
            if duplicate {
                return Err(Error::bad_request(format!(
                    "project with name {name:?} already exists"
                )));
            }
            Ok(token)
        })?;

        let project = Project {
            id: ProjectId::generate(),
            name: name.to_string(),
            parent_id,
        };
        let seq = self
            .dm
            .write_wal(
                vec![Action::put(DataType::Project, project.id.to_string(), &project)?],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(project)
    }

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------

    /// Returns a secret by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if the secret does not exist.
    pub fn get_secret(&self, id: SecretId) -> Result<Secret> {
        self.readdb.do_read(|tx| {
            tx.get_as::<Secret>(DataType::Secret, &id.to_string())?
                .ok_or_else(|| Error::not_found("secret", id))
        })
    }

    /// Returns the secrets visible from a tree node: the node's own
    /// secrets and every ancestor's, deepest first, with parent paths
    /// materialized.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing node; `Fatal` for an unrooted tree.
    pub fn get_secrets_tree(&self, parent_kind: ParentKind, parent_id: &str) -> Result<Vec<Secret>> {
        self.readdb.do_read(|tx| {
            let chain = parent_chain(tx, parent_kind, parent_id)?;
            let all = tx.all_as::<Secret>(DataType::Secret)?;
            let mut out = Vec::new();
            for (node_id, node_path) in &chain {
                for mut secret in all.iter().filter(|s| &s.parent.id == node_id).cloned() {
                    secret.parent.path.clone_from(node_path);
                    out.push(secret);
                }
            }
            Ok(out)
        })
    }

    /// Creates a secret.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid input or a duplicate name; `Conflict`
    /// when racing another create of the same name.
    pub async fn create_secret(&self, request: CreateSecretRequest) -> Result<Secret> {
        if request.name.is_empty() {
            return Err(Error::bad_request("secret name required"));
        }
        if !is_valid_name(&request.name) {
            return Err(Error::bad_request(format!(
                "invalid secret name {:?}",
                request.name
            )));
        }
        if request.secret_type != SecretType::Internal {
            return Err(Error::bad_request("only internal secrets are supported"));
        }
        if request.data.is_empty() {
            return Err(Error::bad_request("empty secret data"));
        }
        if request.parent.id.is_empty() {
            return Err(Error::bad_request("secret parent id required"));
        }

        // The changegroup is the secret name: two concurrent creates of
        // the same name collide even across parents.
        let group = name_group(DataType::Secret, &request.name);

        let cgt = self.readdb.do_read(|tx| {
            let token = tx.change_group_tokens(&[group.clone()]);

            parent_chain(tx, request.parent.kind, &request.parent.id)?;

            let duplicate = tx.all_as::<Secret>(DataType::Secret)?.into_iter().any(|s| {
                s.parent.id == request.parent.id && s.name == request.name
            });
            if duplicate {
                return Err(Error::bad_request(format!(
                    "secret with name {:?} for {} already exists",
                    request.name, request.parent.id
                )));
            }
            Ok(token)
        })?;

        let secret = Secret {
            id: SecretId::generate(),
            name: request.name,
            secret_type: request.secret_type,
            data: request.data,
            parent: Parent {
                kind: request.parent.kind,
                id: request.parent.id,
                path: String::new(),
            },
        };
        let seq = self
            .dm
            .write_wal(
                vec![Action::put(DataType::Secret, secret.id.to_string(), &secret)?],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(secret)
    }

    /// Deletes a secret by parent and name.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such secret exists; `Conflict` when racing a
    /// concurrent mutation of the same secret.
    pub async fn delete_secret(&self, parent_id: &str, name: &str) -> Result<()> {
        let (secret_id, cgt) = self.readdb.do_read(|tx| {
            let secret = tx
                .all_as::<Secret>(DataType::Secret)?
                .into_iter()
                .find(|s| s.parent.id == parent_id && s.name == name)
                .ok_or_else(|| Error::not_found("secret", name))?;
            // The changegroup is the secret id: any concurrent write
            // to this secret invalidates the delete.
            let group = id_group(DataType::Secret, &secret.id.to_string());
            let token = tx.change_group_tokens(&[group]);
            Ok((secret.id, token))
        })?;

        let seq = self
            .dm
            .write_wal(
                vec![Action::delete(DataType::Secret, secret_id.to_string())],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Returns the variables visible from a tree node, deepest first,
    /// with parent paths materialized.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing node; `Fatal` for an unrooted tree.
    pub fn get_variables_tree(
        &self,
        parent_kind: ParentKind,
        parent_id: &str,
    ) -> Result<Vec<Variable>> {
        self.readdb.do_read(|tx| {
            let chain = parent_chain(tx, parent_kind, parent_id)?;
            let all = tx.all_as::<Variable>(DataType::Variable)?;
            let mut out = Vec::new();
            for (node_id, node_path) in &chain {
                for mut variable in all.iter().filter(|v| &v.parent.id == node_id).cloned() {
                    variable.parent.path.clone_from(node_path);
                    out.push(variable);
                }
            }
            Ok(out)
        })
    }

    /// Creates a variable.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid input or a duplicate name; `Conflict`
    /// when racing another create of the same name.
    pub async fn create_variable(&self, request: CreateVariableRequest) -> Result<Variable> {
        if request.name.is_empty() {
            return Err(Error::bad_request("variable name required"));
        }
        if !is_valid_name(&request.name) {
            return Err(Error::bad_request(format!(
                "invalid variable name {:?}",
                request.name
            )));
        }
        if request.values.is_empty() {
            return Err(Error::bad_request("variable values required"));
        }
        if request.parent.id.is_empty() {
            return Err(Error::bad_request("variable parent id required"));
        }

        let group = name_group(DataType::Variable, &request.name);

        let cgt = self.readdb.do_read(|tx| {
            let token = tx.change_group_tokens(&[group.clone()]);

            parent_chain(tx, request.parent.kind, &request.parent.id)?;

            let duplicate = tx
                .all_as::<Variable>(DataType::Variable)?
                .into_iter()
                .any(|v| v.parent.id == request.parent.id && v.name == request.name);
            if duplicate {
                return Err(Error::bad_request(format!(
                    "variable with name {:?} for {} already exists",
                    request.name, request.parent.id
                )));
            }
            Ok(token)
        })?;

        let variable = Variable {
            id: VariableId::generate(),
            name: request.name,
            values: request.values,
            parent: Parent {
                kind: request.parent.kind,
                id: request.parent.id,
                path: String::new(),
            },
        };
        let seq = self
            .dm
            .write_wal(
                vec![Action::put(
                    DataType::Variable,
                    variable.id.to_string(),
                    &variable,
                )?],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(variable)
    }

    /// Deletes a variable by parent and name.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such variable exists; `Conflict` when racing a
    /// concurrent mutation of the same variable.
    pub async fn delete_variable(&self, parent_id: &str, name: &str) -> Result<()> {
        let (variable_id, cgt) = self.readdb.do_read(|tx| {
            let variable = tx
                .all_as::<Variable>(DataType::Variable)?
                .into_iter()
                .find(|v| v.parent.id == parent_id && v.name == name)
                .ok_or_else(|| Error::not_found("variable", name))?;
            let group = id_group(DataType::Variable, &variable.id.to_string());
            let token = tx.change_group_tokens(&[group]);
            Ok((variable.id, token))
        })?;

        let seq = self
            .dm
            .write_wal(
                vec![Action::delete(DataType::Variable, variable_id.to_string())],
                Some(&cgt),
            )
            .await?;
        self.readdb.wait_for_seq(seq).await?;
        Ok(())
    }

    /// Returns the materialized path of a project.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing project; `Fatal` for an unrooted tree.
    pub fn project_path(&self, project_id: ProjectId) -> Result<String> {
        self.readdb.do_read(|tx| {
            let project = tx
                .get_as::<Project>(DataType::Project, &project_id.to_string())?
                .ok_or_else(|| Error::not_found("project", project_id))?;
            Ok(format!(
                "{}/{}",
                group_path(tx, project.parent_id)?,
                project.name
            ))
        })
    }
}

fn change_group_for_child(data_type: DataType, parent: Option<&str>, name: &str) -> String {
    capstan_datamanager::change_group_name(&format!(
        "{}name-{}-{name}",
        data_type.as_str(),
        parent.unwrap_or("root")
    ))
}

/// Materializes a project group's path, walking up to the root.
///
/// The walk is bounded: a chain longer than [`MAX_PARENT_DEPTH`] means
/// the stored tree has a cycle.
fn group_path(tx: &ReadTx, id: ProjectGroupId) -> Result<String> {
    let mut components = Vec::new();
    let mut current = Some(id);
    for _ in 0..MAX_PARENT_DEPTH {
        let Some(group_id) = current else {
            components.reverse();
            return Ok(components.join("/"));
        };
        let group = tx
            .get_as::<ProjectGroup>(DataType::ProjectGroup, &group_id.to_string())?
            .ok_or_else(|| Error::not_found("project group", group_id))?;
        components.push(group.name);
        current = group.parent_id;
    }
    Err(Error::fatal(format!(
        "project group {id} parent chain exceeds depth {MAX_PARENT_DEPTH}; tree is cyclic"
    )))
}

/// Returns `(node id, node path)` pairs from a tree node up to the
/// root, deepest first.
fn parent_chain(
    tx: &ReadTx,
    parent_kind: ParentKind,
    parent_id: &str,
) -> Result<Vec<(String, String)>> {
    let mut chain = Vec::new();

    let mut group_id = match parent_kind {
        ParentKind::Project => {
            let project = tx
                .get_as::<Project>(DataType::Project, parent_id)?
                .ok_or_else(|| Error::not_found("project", parent_id))?;
            let path = format!("{}/{}", group_path(tx, project.parent_id)?, project.name);
            chain.push((parent_id.to_string(), path));
            Some(project.parent_id)
        }
        ParentKind::ProjectGroup => Some(
            parent_id
                .parse()
                .map_err(|_| Error::bad_request(format!("invalid project group id {parent_id:?}")))?,
        ),
    };

    for _ in 0..MAX_PARENT_DEPTH {
        let Some(id) = group_id else {
            return Ok(chain);
        };
        chain.push((id.to_string(), group_path(tx, id)?));
        let group = tx
            .get_as::<ProjectGroup>(DataType::ProjectGroup, &id.to_string())?
            .ok_or_else(|| Error::not_found("project group", id))?;
        group_id = group.parent_id;
    }
    Err(Error::fatal(format!(
        "parent chain of {parent_id} exceeds depth {MAX_PARENT_DEPTH}; tree is cyclic"
    )))
}
