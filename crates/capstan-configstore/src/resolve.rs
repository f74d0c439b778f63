//! Hierarchical secret and variable resolution.
//!
//! Variables and secrets are collected from a tree node and its
//! ancestors, deepest first. A child scope shadows an ancestor's
//! variable of the same name, and a variable may only reference a
//! secret living at or above its own scope.

use std::collections::HashMap;

use crate::types::{is_ancestor_path, Secret, Variable, VariableValue};
use crate::when::{When, WhenContext};

use capstan_core::Result;

/// Drops variables shadowed by a deeper scope.
///
/// Input must be sorted deepest-parent-first (leaves to root), as the
/// tree lookups return it. Order is preserved; only the first
/// occurrence of each name survives. Duplicates within one parent do
/// not occur by invariant.
#[must_use]
pub fn filter_overriden_variables(variables: &[Variable]) -> Vec<Variable> {
    let mut seen: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for variable in variables {
        if seen.contains(&variable.name.as_str()) {
            continue;
        }
        seen.push(&variable.name);
        out.push(variable.clone());
    }
    out
}

/// Selects the secret a variable value refers to.
///
/// Eligible secrets have the referenced name and a parent path that is
/// an ancestor of or equal to `var_parent_path`; among them the
/// nearest (deepest) ancestor wins. Secrets strictly below the
/// variable's scope are never eligible: a variable may not reference
/// a secret more specific than itself.
#[must_use]
pub fn get_var_value_matching_secret<'a>(
    var_value: &VariableValue,
    var_parent_path: &str,
    secrets: &'a [Secret],
) -> Option<&'a Secret> {
    secrets
        .iter()
        .filter(|secret| {
            secret.name == var_value.secret_name
                && is_ancestor_path(&secret.parent.path, var_parent_path)
        })
        .max_by_key(|secret| secret.parent.path.split('/').count())
}

fn when_matches(when: Option<&When>, ctx: &WhenContext<'_>) -> Result<bool> {
    match when {
        Some(when) => when.matches(ctx),
        None => Ok(true),
    }
}

/// Materializes the `name → value` environment for a task.
///
/// `variables` and `secrets` are the tree lookups for the project,
/// deepest first. For each unshadowed variable, the first value whose
/// `when` matches the trigger is selected and resolved against an
/// in-scope secret; variables without a matching value or a resolvable
/// secret are omitted.
///
/// # Errors
///
/// Returns `BadRequest` for an invalid `when` pattern.
pub fn resolve_environment(
    variables: &[Variable],
    secrets: &[Secret],
    ctx: &WhenContext<'_>,
) -> Result<HashMap<String, String>> {
    let mut environment = HashMap::new();

    for variable in filter_overriden_variables(variables) {
        let mut selected = None;
        for value in &variable.values {
            if when_matches(value.when.as_ref(), ctx)? {
                selected = Some(value);
                break;
            }
        }
        let Some(value) = selected else {
            continue;
        };

        let Some(secret) = get_var_value_matching_secret(value, &variable.parent.path, secrets)
        else {
            tracing::warn!(
                variable = %variable.name,
                secret = %value.secret_name,
                scope = %variable.parent.path,
                "variable references no in-scope secret"
            );
            continue;
        };

        if let Some(secret_value) = secret.data.get(&value.secret_var) {
            environment.insert(variable.name.clone(), secret_value.clone());
        }
    }

    Ok(environment)
}
