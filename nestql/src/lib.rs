//! nestql core library.
//!
//! Declarative resource descriptors, query-string parsing into filter, embed,
//! sort and pagination specs, and nested mutation documents committed as one
//! plan against a pluggable [`Store`].
//!
//! # Permissions
//!
//! **Everything is allowed by default.** A resource registered without a
//! [`PermissionGate`] can be read and written by any caller, including nested
//! writes reaching it through a relationship. Register gates on the
//! [`RegistryBuilder`] before exposing an [`Engine`] to untrusted input.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nestql::{Engine, FieldDescriptor, MemoryStore, QueryParams, Registry, RequestContext, ResourceDescriptor};
//!
//! # async fn demo() -> Result<(), nestql::EngineError> {
//! let registry = Arc::new(
//!     Registry::builder()
//!         .resource(
//!             ResourceDescriptor::new("artists")
//!                 .identity(["artist_id"])
//!                 .field(FieldDescriptor::integer("artist_id").generated())
//!                 .field(FieldDescriptor::string("name")),
//!         )
//!         .build()?,
//! );
//! let engine = Engine::new(Arc::clone(&registry));
//! let mut store = MemoryStore::new(registry);
//! let ctx = RequestContext::new();
//! let artists = engine.resource("artists")?;
//! artists.create(&mut store, &ctx, serde_json::json!({"name": "Miles Davis"}), &QueryParams::new()).await?;
//! let page = artists.list(&mut store, &ctx, &QueryParams::parse("name-like=Miles%25")).await?;
//! assert_eq!(page.resources_available, 1);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod engine;
pub mod errors;
pub mod examples;
pub mod filters;
pub mod id;
pub mod keys;
pub mod mutation;
pub mod permissions;
pub mod query;
pub mod registry;
pub mod router;
pub mod store;
pub mod types;

pub use builder::{CompiledQuery, QueryBuilder, RenderOptions, ResourceCollection};
pub use config::{Backend, ConfigError, EngineConfig};
pub use engine::{DeleteOutcome, DeleteTarget, Engine, ResourceHandle};
pub use errors::*;
pub use filters::{FilterExpr, Operator, Predicate};
pub use mutation::{Mode, MutationOutcome, MutationProcessor};
pub use permissions::{AllowAll, Method, MutationCheck, PermissionGate, ReadOnly, RequestContext};
pub use query::{Embed, EmbedSpec, Pagination, PaginationInfo, ParsedQuery, QueryParams, QueryParser};
pub use registry::{Registry, RegistryBuilder};
pub use router::{Request, Response, Router};
pub use store::{MemoryStore, RedisStore, Store, Tables};
pub use types::{
    CascadePolicy, FieldDescriptor, FieldType, Identity, Record, RelationshipDescriptor, ResourceDescriptor, SortOrder,
    SortSpec, ValidationRule,
};

// Re-export redis so hosts share the store's client version.
pub use redis;
