//! Invalidation rules for the requirements/architecture domain

use crate::invalidation::event::EntityOperation;
use crate::invalidation::rule::{InvalidationRule, RuleCondition};
use std::time::Duration;

/// Graph query results
pub const NEO4J_NAMESPACE: &str = "neo4j";
/// Resolver results
pub const GRAPHQL_NAMESPACE: &str = "graphql";
/// Similarity scores between requirements
pub const SIMILARITY_NAMESPACE: &str = "similarity";

const SIMILARITY_DEBOUNCE: Duration = Duration::from_secs(5);
const BULK_IMPORT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Rule set registered by [`InvalidationEngine::with_default_rules`](crate::invalidation::InvalidationEngine::with_default_rules)
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::new("requirement-created", "Requirement created", "requirement.created")
            .pattern("*requirements*")
            .pattern("*project*{data.projectId}*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new("requirement-updated", "Requirement updated", "requirement.updated")
            .pattern("*requirement*{entityId}*")
            .pattern("*project*{data.projectId}*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new("requirement-deleted", "Requirement deleted", "requirement.deleted")
            .pattern("*requirement*{entityId}*")
            .pattern("*requirements*")
            .pattern("*project*{data.projectId}*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE, SIMILARITY_NAMESPACE]),
        // text edits change similarity; bursts of edits recompute once
        InvalidationRule::new(
            "requirement-similarity",
            "Requirement text changed",
            "requirement.updated",
        )
        .pattern("*{entityId}*")
        .namespace(SIMILARITY_NAMESPACE)
        .condition(RuleCondition::Any(vec![
            RuleCondition::DataFieldPresent("title".to_string()),
            RuleCondition::DataFieldPresent("description".to_string()),
        ]))
        .delay(SIMILARITY_DEBOUNCE),
        InvalidationRule::new("project-updated", "Project updated", "project.updated")
            .pattern("*project*{entityId}*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new("project-deleted", "Project deleted", "project.deleted")
            .pattern("*project*{entityId}*")
            .pattern("*projects*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE, SIMILARITY_NAMESPACE]),
        InvalidationRule::new(
            "architecture-decision-changed",
            "Architecture decision changed",
            "architecture.updated",
        )
        .pattern("*architecture*{entityId}*")
        .pattern("*project*{data.projectId}*")
        .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new(
            "architecture-decision-deleted",
            "Architecture decision deleted",
            "architecture.deleted",
        )
        .pattern("*architecture*{entityId}*")
        .pattern("*project*{data.projectId}*")
        .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new("stakeholder-updated", "Stakeholder updated", "stakeholder.updated")
            .pattern("*stakeholder*{entityId}*")
            .pattern("*project*{data.projectId}*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE]),
        InvalidationRule::new("bulk-import", "Bulk import", "bulk.import")
            .pattern("*project*{data.projectId}*")
            .pattern("*requirements*")
            .namespaces([NEO4J_NAMESPACE, GRAPHQL_NAMESPACE, SIMILARITY_NAMESPACE])
            .condition(RuleCondition::Operation(EntityOperation::Bulk))
            .delay(BULK_IMPORT_DEBOUNCE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::event::InvalidationEvent;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_default_rules_are_valid_and_unique() {
        let rules = default_rules();
        let ids: HashSet<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), rules.len());
        for rule in &rules {
            rule.validate().unwrap();
        }
    }

    #[test]
    fn test_similarity_rule_only_for_text_edits() {
        let rules = default_rules();
        let similarity = rules
            .iter()
            .find(|r| r.id == "requirement-similarity")
            .unwrap();

        let status_only = InvalidationEvent::new("requirement", "42", EntityOperation::Update)
            .with_data(json!({"status": "approved"}));
        assert!(!similarity.matches(&status_only));

        let retitled = InvalidationEvent::new("requirement", "42", EntityOperation::Update)
            .with_data(json!({"title": "New title"}));
        assert!(similarity.matches(&retitled));
    }
}
