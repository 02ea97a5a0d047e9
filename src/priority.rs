// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Static ordering rules.
//!
//! Priority groups are an ordered list of groups; the outer index is the
//! primary rank and the position inside a group the secondary rank. Each rule
//! may name the payload fields that reference a parent aggregate which must
//! exist before the event can be replayed.
//!
//! ```yaml
//! priority_groups:
//!   - - entity_type: address
//!   - - entity_type: customer
//!       dependencies: [{ field: address_id, parent: address }]
//!     - entity_type: invoice
//!       dependencies:
//!         - { field: customer_id, parent: customer }
//!         - { field: billing_address_id, parent: address }
//!   - - entity_type: invoice_line
//!       dependencies: [{ field: invoice_id, parent: invoice }]
//! ```

use crate::error::{Result, SyncError};
use crate::event::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A payload field referencing a parent aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyField {
    /// Field name in the changed row (same name in both schemas).
    pub field: String,
    /// Entity type the field points at.
    pub parent: EntityType,
}

impl DependencyField {
    pub fn new(field: impl Into<String>, parent: EntityType) -> Self {
        Self {
            field: field.into(),
            parent,
        }
    }
}

/// Ordering rule for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDependency {
    pub entity_type: EntityType,
    #[serde(default)]
    pub dependencies: Vec<DependencyField>,
}

impl PriorityDependency {
    /// A rule with no parent.
    pub fn root(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            dependencies: Vec::new(),
        }
    }

    /// A rule whose events need `parent` (referenced by `field`) to exist first.
    pub fn depends_on(mut self, field: impl Into<String>, parent: EntityType) -> Self {
        self.dependencies.push(DependencyField::new(field, parent));
        self
    }
}

/// Ordered list of priority groups.
pub type PriorityGroups = Vec<Vec<PriorityDependency>>;

/// The ordering for the four replicated aggregates.
pub fn default_priority_groups() -> PriorityGroups {
    vec![
        vec![PriorityDependency::root(EntityType::Address)],
        vec![
            PriorityDependency::root(EntityType::Customer).depends_on("address_id", EntityType::Address),
            PriorityDependency::root(EntityType::Invoice)
                .depends_on("customer_id", EntityType::Customer)
                .depends_on("billing_address_id", EntityType::Address),
        ],
        vec![PriorityDependency::root(EntityType::InvoiceLine).depends_on("invoice_id", EntityType::Invoice)],
    ]
}

/// (primary, secondary) rank of an entity type. Unlisted types rank last.
pub fn rank_of(entity: Option<EntityType>, groups: &[Vec<PriorityDependency>]) -> (usize, usize) {
    entity
        .and_then(|entity| {
            groups.iter().enumerate().find_map(|(primary, group)| {
                group
                    .iter()
                    .position(|rule| rule.entity_type == entity)
                    .map(|secondary| (primary, secondary))
            })
        })
        .unwrap_or((groups.len(), 0))
}

/// The rule for an entity type, if listed.
pub fn rule_for(entity: EntityType, groups: &[Vec<PriorityDependency>]) -> Option<&PriorityDependency> {
    groups.iter().flatten().find(|rule| rule.entity_type == entity)
}

/// Parent references declared for an entity type.
pub fn dependencies_of(entity: EntityType, groups: &[Vec<PriorityDependency>]) -> &[DependencyField] {
    rule_for(entity, groups)
        .map(|rule| rule.dependencies.as_slice())
        .unwrap_or(&[])
}

/// Whether some other type names this one as its parent.
pub fn is_parent_type(entity: EntityType, groups: &[Vec<PriorityDependency>]) -> bool {
    groups
        .iter()
        .flatten()
        .flat_map(|rule| rule.dependencies.iter())
        .any(|dep| dep.parent == entity)
}

/// Reject rule sets that could never be satisfied in order.
///
/// Every type may appear once, and every parent must rank strictly ahead of
/// its dependents.
pub fn validate(groups: &[Vec<PriorityDependency>]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in groups.iter().flatten() {
        if !seen.insert(rule.entity_type) {
            return Err(SyncError::Config(format!(
                "entity type '{}' listed in more than one priority slot",
                rule.entity_type
            )));
        }
    }

    for rule in groups.iter().flatten() {
        let own = rank_of(Some(rule.entity_type), groups);
        for dep in &rule.dependencies {
            if !seen.contains(&dep.parent) {
                return Err(SyncError::Config(format!(
                    "'{}' depends on unlisted type '{}'",
                    rule.entity_type, dep.parent
                )));
            }
            if rank_of(Some(dep.parent), groups) >= own {
                return Err(SyncError::Config(format!(
                    "'{}' must rank after its parent '{}'",
                    rule.entity_type, dep.parent
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ranks() {
        let groups = default_priority_groups();
        assert_eq!(rank_of(Some(EntityType::Address), &groups), (0, 0));
        assert_eq!(rank_of(Some(EntityType::Customer), &groups), (1, 0));
        assert_eq!(rank_of(Some(EntityType::Invoice), &groups), (1, 1));
        assert_eq!(rank_of(Some(EntityType::InvoiceLine), &groups), (2, 0));
        assert_eq!(rank_of(None, &groups), (3, 0));
    }

    #[test]
    fn test_default_rules_validate() {
        assert!(validate(&default_priority_groups()).is_ok());
    }

    #[test]
    fn test_dependencies_of() {
        let groups = default_priority_groups();
        assert!(dependencies_of(EntityType::Address, &groups).is_empty());
        let invoice = dependencies_of(EntityType::Invoice, &groups);
        assert_eq!(invoice.len(), 2);
        assert_eq!(invoice[0], DependencyField::new("customer_id", EntityType::Customer));
        assert_eq!(invoice[1].parent, EntityType::Address);
    }

    #[test]
    fn test_is_parent_type() {
        let groups = default_priority_groups();
        assert!(is_parent_type(EntityType::Address, &groups));
        assert!(is_parent_type(EntityType::Customer, &groups));
        assert!(is_parent_type(EntityType::Invoice, &groups));
        assert!(!is_parent_type(EntityType::InvoiceLine, &groups));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let groups = vec![
            vec![PriorityDependency::root(EntityType::Address)],
            vec![PriorityDependency::root(EntityType::Address)],
        ];
        assert!(matches!(validate(&groups), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_parent_ranked_after_child() {
        let groups = vec![
            vec![PriorityDependency::root(EntityType::InvoiceLine).depends_on("invoice_id", EntityType::Invoice)],
            vec![PriorityDependency::root(EntityType::Invoice)],
        ];
        assert!(validate(&groups).is_err());
    }

    #[test]
    fn test_validate_rejects_unlisted_parent() {
        let groups = vec![vec![
            PriorityDependency::root(EntityType::Customer).depends_on("address_id", EntityType::Address),
        ]];
        assert!(validate(&groups).is_err());
    }

    #[test]
    fn test_yaml_shape_deserializes() {
        let json = r#"[[{"entity_type":"address"}],[{"entity_type":"customer","dependencies":[{"field":"address_id","parent":"address"}]}]]"#;
        let groups: PriorityGroups = serde_json::from_str(json).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0][0].dependencies.is_empty());
        assert_eq!(groups[1][0].dependencies[0].parent, EntityType::Address);
    }
}
