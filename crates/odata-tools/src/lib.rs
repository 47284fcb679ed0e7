//! OData -> MCP tooling.
//!
//! Reads a service's CSDL metadata document, synthesizes a catalog of typed operations from it and
//! executes those operations as OData requests. [`source::ODataToolSource`] ties the pieces
//! together behind the MCP `Tool` / `CallToolResult` types.
//!
//! Holds no transport logic: the host decides how tools reach clients.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod model;
pub mod naming;
pub mod runtime;
pub mod safety;
pub mod semantics;
pub mod source;

pub use cache::{CatalogCache, CatalogSnapshot};
pub use catalog::{OperationDescriptor, OperationKind, synthesize};
pub use config::{ServiceConfig, ToolProfile};
pub use error::{ExecutionError, ODataToolsError, Result};
pub use metadata::parse_metadata;
pub use model::Model;
pub use runtime::ODataExecutor;
pub use source::ODataToolSource;
