//! # capstan-configstore
//!
//! The project tree with its secrets and variables, persisted through
//! the datamanager, plus the hierarchical resolution rules:
//!
//! - a child scope shadows an ancestor's variable of the same name
//! - a variable may only reference a secret at or above its own scope,
//!   nearest ancestor winning
//!
//! Mutations are optimistically concurrent: duplicate-name checks and
//! changegroup token capture happen in one ReadDB transaction, and the
//! WAL commit fails with `Conflict` if anything it depended on moved.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod actions;
pub mod resolve;
pub mod types;
pub mod when;

pub use actions::{ActionHandler, CreateSecretRequest, CreateVariableRequest};
pub use resolve::{
    filter_overriden_variables, get_var_value_matching_secret, resolve_environment,
};
pub use types::{
    is_ancestor_path, is_valid_name, Parent, ParentKind, Project, ProjectGroup, Secret,
    SecretType, Variable, VariableValue,
};
pub use when::{MatchType, When, WhenCondition, WhenConditions, WhenContext};
