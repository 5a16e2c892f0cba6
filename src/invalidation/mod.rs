//! # Invalidation Rule Engine
//!
//! Turns domain change events into pattern invalidations on the tiered store.
//!
//! - **Rules** pair a trigger event type with glob templates and namespaces
//! - **Conditions** gate a rule on entity type, operation or `data` fields
//! - **Debounce** collapses bursts for the same entity into one invalidation
//! - **Distribution** publishes every emitted event on the `invalidation`
//!   channel and replays peer events locally
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_cache::backend::MemoryBackend;
//! use ouroboros_cache::cache::TieredCache;
//! use ouroboros_cache::invalidation::{
//!     EntityOperation, InvalidationEngine, InvalidationEvent, InvalidationRule,
//! };
//! use ouroboros_cache::CacheSettings;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = CacheSettings::builder().build();
//! let cache = Arc::new(TieredCache::new(Arc::new(MemoryBackend::new()), &settings));
//! let engine = InvalidationEngine::new(cache);
//!
//! engine
//!     .add_rule(
//!         InvalidationRule::new("req-updated", "Requirement updated", "requirement.updated")
//!             .pattern("*requirement*{entityId}*")
//!             .namespace("neo4j"),
//!     )
//!     .await?;
//!
//! engine
//!     .emit(InvalidationEvent::new("requirement", "42", EntityOperation::Update))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod defaults;
pub mod engine;
pub mod event;
pub mod rule;

pub use defaults::{default_rules, GRAPHQL_NAMESPACE, NEO4J_NAMESPACE, SIMILARITY_NAMESPACE};
pub use engine::{InvalidationEngine, InvalidationMetrics};
pub use event::{EntityOperation, InvalidationEvent};
pub use rule::{resolve_template, InvalidationRule, Predicate, RuleCondition};
