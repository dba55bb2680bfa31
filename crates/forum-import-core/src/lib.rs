//! Forum import engine: schema-constrained record writing, the legacy identifier map,
//! resumable step cursors and the dependency-ordered step runner.

pub mod cursor;
pub mod data;
pub mod error;
pub mod graph;
pub mod handler;
pub mod memory;
pub mod permissions;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod session;
pub mod source;
pub mod storage;
pub mod text;
pub mod value;
pub mod writer;

pub use cursor::{StepState, StepTimer};
pub use error::{ImportError, ImportResult};
pub use graph::{StepDefinition, StepGraph};
pub use handler::{
    DeferredTask, HandlerOptions, ImportHandler, ImportTarget, RecordHandler, SaveOutcome,
};
pub use registry::{HandlerRegistry, ImporterRegistry, RegisteredHandler};
pub use runner::{
    Importer, InvocationReport, InvocationStatus, RunReport, Runner, RunnerOptions, StepContext,
};
pub use schema::{Column, ColumnType, ConstraintMode, TableSchema};
pub use session::{ImportContext, ImportSession, SessionOptions, StepProgress, StepStatus};
pub use source::{Filter, SourceQuery, SourceRows};
pub use storage::{IdentifierMap, ImportStore, RunnerStore, SessionStore, TargetStorage};
pub use text::TextConverter;
pub use value::{Row, RowExt, Value};
pub use writer::{RecordWriter, SetOptions};
