//! Invalidation rules, conditions and pattern templates

use crate::cache::types::escape_glob;
use crate::error::{CacheError, Result};
use crate::invalidation::event::{EntityOperation, InvalidationEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// In-process predicate over an event
pub type Predicate = Arc<dyn Fn(&InvalidationEvent) -> bool + Send + Sync>;

/// Condition a rule's triggering event must satisfy
#[derive(Clone)]
pub enum RuleCondition {
    /// Entity type equals
    EntityType(String),

    /// Operation equals
    Operation(EntityOperation),

    /// `data` field (dotted path) equals a JSON value
    DataFieldEquals { field: String, value: Value },

    /// `data` field (dotted path) is present and not null
    DataFieldPresent(String),

    All(Vec<RuleCondition>),

    Any(Vec<RuleCondition>),

    Not(Box<RuleCondition>),

    /// Arbitrary check; never serialized or sent to peers
    Predicate(Predicate),
}

impl RuleCondition {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&InvalidationEvent) -> bool + Send + Sync + 'static,
    {
        RuleCondition::Predicate(Arc::new(f))
    }

    pub fn data_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        RuleCondition::DataFieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn evaluate(&self, event: &InvalidationEvent) -> bool {
        match self {
            RuleCondition::EntityType(entity_type) => event.entity_type == *entity_type,
            RuleCondition::Operation(operation) => event.operation == *operation,
            RuleCondition::DataFieldEquals { field, value } => {
                event.data_field(field) == Some(value)
            }
            RuleCondition::DataFieldPresent(field) => event.data_field(field).is_some(),
            RuleCondition::All(conditions) => conditions.iter().all(|c| c.evaluate(event)),
            RuleCondition::Any(conditions) => conditions.iter().any(|c| c.evaluate(event)),
            RuleCondition::Not(condition) => !condition.evaluate(event),
            RuleCondition::Predicate(f) => f(event),
        }
    }
}

impl fmt::Debug for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCondition::EntityType(t) => f.debug_tuple("EntityType").field(t).finish(),
            RuleCondition::Operation(op) => f.debug_tuple("Operation").field(op).finish(),
            RuleCondition::DataFieldEquals { field, value } => f
                .debug_struct("DataFieldEquals")
                .field("field", field)
                .field("value", value)
                .finish(),
            RuleCondition::DataFieldPresent(field) => {
                f.debug_tuple("DataFieldPresent").field(field).finish()
            }
            RuleCondition::All(c) => f.debug_tuple("All").field(c).finish(),
            RuleCondition::Any(c) => f.debug_tuple("Any").field(c).finish(),
            RuleCondition::Not(c) => f.debug_tuple("Not").field(c).finish(),
            RuleCondition::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

/// A registered invalidation rule
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    pub enabled: bool,

    /// Event type that triggers the rule
    pub trigger_event: String,

    /// Glob templates with `{entityId}`, `{entityType}`, `{operation}` and
    /// `{data.<field>}` placeholders
    pub pattern_templates: Vec<String>,

    /// Namespaces every template is applied in
    pub namespaces: Vec<String>,

    pub condition: Option<RuleCondition>,

    /// Debounce window; pending firings for the same entity are replaced
    pub delay: Option<Duration>,
}

impl InvalidationRule {
    /// Enabled rule with no patterns, namespaces, condition or delay
    pub fn new(id: impl Into<String>, name: impl Into<String>, trigger_event: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            trigger_event: trigger_event.into(),
            pattern_templates: Vec::new(),
            namespaces: Vec::new(),
            condition: None,
            delay: None,
        }
    }

    pub fn pattern(mut self, template: impl Into<String>) -> Self {
        self.pattern_templates.push(template.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn condition(mut self, condition: RuleCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether an event fires this rule
    pub fn matches(&self, event: &InvalidationEvent) -> bool {
        self.enabled
            && self.trigger_event == event.event_type
            && self
                .condition
                .as_ref()
                .map_or(true, |condition| condition.evaluate(event))
    }

    /// Every `(namespace, resolved pattern)` pair for an event
    pub fn resolve(&self, event: &InvalidationEvent) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.namespaces.len() * self.pattern_templates.len());
        for namespace in &self.namespaces {
            for template in &self.pattern_templates {
                pairs.push((namespace.clone(), resolve_template(template, event)));
            }
        }
        pairs
    }

    /// Validate the rule definition
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CacheError::ConfigError("rule id must not be empty".to_string()));
        }
        if self.trigger_event.trim().is_empty() {
            return Err(CacheError::ConfigError(format!(
                "rule {} has no trigger event",
                self.id
            )));
        }
        if self.pattern_templates.is_empty() {
            return Err(CacheError::ConfigError(format!(
                "rule {} has no pattern templates",
                self.id
            )));
        }
        if self.namespaces.is_empty() {
            return Err(CacheError::ConfigError(format!(
                "rule {} has no namespaces",
                self.id
            )));
        }
        if self.delay.is_some_and(|d| d.is_zero()) {
            return Err(CacheError::ConfigError(format!(
                "rule {} has a zero delay",
                self.id
            )));
        }
        Ok(())
    }
}

/// Substitute placeholders in a pattern template.
///
/// Resolved values are glob-escaped. `{data.<field>}` with no value becomes
/// `*`. Unknown placeholders are left as written.
pub fn resolve_template(template: &str, event: &InvalidationEvent) -> String {
    let mut out = String::with_capacity(template.len() + event.entity_id.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let name = &after[..close];
        match name {
            "entityId" => out.push_str(&escape_glob(&event.entity_id)),
            "entityType" => out.push_str(&escape_glob(&event.entity_type)),
            "operation" => out.push_str(event.operation.as_str()),
            _ => match name.strip_prefix("data.") {
                Some(field) => match event.data_text(field) {
                    Some(value) => out.push_str(&escape_glob(&value)),
                    None => out.push('*'),
                },
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            },
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn updated(id: &str) -> InvalidationEvent {
        InvalidationEvent::new("requirement", id, EntityOperation::Update)
            .with_data(json!({"projectId": "p1", "status": "draft"}))
    }

    #[test]
    fn test_resolve_template_placeholders() {
        let event = updated("42");
        assert_eq!(
            resolve_template("*requirement*{entityId}*", &event),
            "*requirement*42*"
        );
        assert_eq!(
            resolve_template("{entityType}:{operation}:{data.projectId}", &event),
            "requirement:update:p1"
        );
    }

    #[test]
    fn test_unresolved_data_becomes_wildcard() {
        let event = InvalidationEvent::new("project", "p1", EntityOperation::Delete);
        assert_eq!(resolve_template("*project*{data.ownerId}*", &event), "*project***");
        assert!(!resolve_template("{data.x}", &event).contains("undefined"));
    }

    #[test]
    fn test_unknown_and_unterminated_placeholders() {
        let event = updated("42");
        assert_eq!(resolve_template("{tenant}:{entityId}", &event), "{tenant}:42");
        assert_eq!(resolve_template("x{entityId", &event), "x{entityId");
    }

    #[test]
    fn test_resolved_values_are_escaped() {
        let event = InvalidationEvent::new("requirement", "a*b", EntityOperation::Update);
        assert_eq!(resolve_template("*{entityId}*", &event), r"*a\*b*");
    }

    #[test]
    fn test_condition_evaluation() {
        let event = updated("42");

        assert!(RuleCondition::EntityType("requirement".into()).evaluate(&event));
        assert!(RuleCondition::Operation(EntityOperation::Update).evaluate(&event));
        assert!(RuleCondition::data_equals("status", "draft").evaluate(&event));
        assert!(!RuleCondition::DataFieldPresent("title".into()).evaluate(&event));
        assert!(RuleCondition::All(vec![
            RuleCondition::DataFieldPresent("projectId".into()),
            RuleCondition::Not(Box::new(RuleCondition::data_equals("status", "final"))),
        ])
        .evaluate(&event));
        assert!(!RuleCondition::Any(vec![]).evaluate(&event));
        assert!(RuleCondition::predicate(|e| e.entity_id.len() == 2).evaluate(&event));
    }

    #[test]
    fn test_rule_matching() {
        let rule = InvalidationRule::new("r1", "Requirement updated", "requirement.updated")
            .pattern("*requirement*{entityId}*")
            .namespace("neo4j")
            .condition(RuleCondition::data_equals("status", "final"));

        assert!(!rule.matches(&updated("42")));

        let final_event = updated("42").with_data(json!({"status": "final"}));
        assert!(rule.matches(&final_event));
        assert!(!rule.clone().disabled().matches(&final_event));

        let created = InvalidationEvent::new("requirement", "42", EntityOperation::Create)
            .with_data(json!({"status": "final"}));
        assert!(!rule.matches(&created));
    }

    #[test]
    fn test_resolve_pairs_cover_every_namespace() {
        let rule = InvalidationRule::new("r1", "r", "requirement.updated")
            .pattern("*requirement*{entityId}*")
            .pattern("*project*{data.projectId}*")
            .namespaces(["neo4j", "graphql"]);

        let pairs = rule.resolve(&updated("42"));
        assert_eq!(pairs.len(), 4);
        assert!(pairs.contains(&("graphql".to_string(), "*project*p1*".to_string())));
    }

    #[test]
    fn test_validate() {
        let base = InvalidationRule::new("r1", "r", "requirement.updated");
        assert!(base.validate().is_err());
        assert!(base.clone().pattern("*").validate().is_err());
        assert!(base.clone().pattern("*").namespace("neo4j").validate().is_ok());
        assert!(base
            .pattern("*")
            .namespace("neo4j")
            .delay(Duration::ZERO)
            .validate()
            .is_err());
    }
}
