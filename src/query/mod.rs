//! Seam between the query cache and the query engine.
//!
//! The cache never looks inside a term. It hands raw terms to a
//! [`QueryCompiler`], evaluates the resulting [`CompiledTerm`] once, and pulls
//! batches from any [`DatumStream`] the evaluation leaves behind.

pub mod backtrace;
pub mod batch;
pub mod error;
pub mod grouped;

use crate::config::CacheConfig;
use crate::context::ServerContext;
use crate::interrupt::CombinedInterruptor;
use crate::profile::ProfileTrace;
use crate::query::backtrace::BacktraceRegistry;
use crate::query::batch::{BatchSpec, FeedType};
use crate::query::error::{CompileError, EvalError};
use crate::query::grouped::GroupedData;
use crate::response::ResponseNote;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub type Datum = serde_json::Value;

/// Term tree as received from the client, before validation.
pub type RawTerm = serde_json::Value;

/// Query-wide optional arguments (`db`, `read_mode`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalOptargs(serde_json::Map<String, Datum>);

impl GlobalOptargs {
    pub fn new(map: serde_json::Map<String, Datum>) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datum)> {
        self.0.iter()
    }
}

/// Variables visible to a term at compile time. Top-level queries compile
/// against an empty scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarScope {
    visible: BTreeSet<u64>,
}

impl VarScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, var: u64) -> Self {
        self.visible.insert(var);
        self
    }

    pub fn is_visible(&self, var: u64) -> bool {
        self.visible.contains(&var)
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

/// Result of evaluating a compiled term.
pub enum Value {
    Datum(Datum),
    Grouped(GroupedData),
    Sequence(Box<dyn DatumStream>),
    /// Any other result category (functions, tables, ...). The cache cannot
    /// return these and reports a fault naming the type.
    Other(&'static str),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Datum(_) => "DATUM",
            Value::Grouped(_) => "GROUPED_DATA",
            Value::Sequence(_) => "SEQUENCE",
            Value::Other(name) => name,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Datum(d) => f.debug_tuple("Datum").field(d).finish(),
            Value::Grouped(g) => f.debug_tuple("Grouped").field(g).finish(),
            Value::Sequence(s) => f
                .debug_struct("Sequence")
                .field("feed_type", &s.feed_type())
                .field("exhausted", &s.is_exhausted())
                .finish(),
            Value::Other(name) => f.debug_tuple("Other").field(name).finish(),
        }
    }
}

pub trait QueryCompiler: Send + Sync {
    /// Validates and normalizes `term` in place, registering a frame for
    /// every sub-term so later faults can be located.
    fn preprocess(
        &self,
        term: &mut RawTerm,
        bt_reg: &mut BacktraceRegistry,
    ) -> Result<(), CompileError>;

    fn compile(
        &self,
        scope: &VarScope,
        term: &RawTerm,
    ) -> Result<Box<dyn CompiledTerm>, CompileError>;
}

#[async_trait]
pub trait CompiledTerm: Send + Sync {
    async fn eval(&self, env: &mut EvalEnv) -> Result<Value, EvalError>;
}

/// Lazy, possibly unbounded sequence of datums.
#[async_trait]
pub trait DatumStream: Send {
    async fn next_batch(
        &mut self,
        env: &mut EvalEnv,
        spec: BatchSpec,
    ) -> Result<Vec<Datum>, EvalError>;

    fn is_exhausted(&self) -> bool;

    /// Materializes the whole sequence when it is small and bounded;
    /// `Ok(None)` means the sequence must be streamed.
    async fn as_array(&mut self, env: &mut EvalEnv) -> Result<Option<Vec<Datum>>, EvalError>;

    fn feed_type(&self) -> FeedType;

    fn notes(&self) -> Vec<ResponseNote> {
        Vec::new()
    }
}

/// Everything an evaluation may consult, rebuilt for each response.
pub struct EvalEnv {
    context: Arc<ServerContext>,
    interruptor: CombinedInterruptor,
    global_optargs: Arc<GlobalOptargs>,
    return_empty_normal_batches: bool,
    trace: Option<ProfileTrace>,
}

impl EvalEnv {
    pub fn new(
        context: Arc<ServerContext>,
        interruptor: CombinedInterruptor,
        global_optargs: Arc<GlobalOptargs>,
        return_empty_normal_batches: bool,
        trace: Option<ProfileTrace>,
    ) -> Self {
        Self {
            context,
            interruptor,
            global_optargs,
            return_empty_normal_batches,
            trace,
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn config(&self) -> &CacheConfig {
        self.context.config()
    }

    pub fn interruptor(&self) -> &CombinedInterruptor {
        &self.interruptor
    }

    pub fn global_optargs(&self) -> &GlobalOptargs {
        &self.global_optargs
    }

    pub fn return_empty_normal_batches(&self) -> bool {
        self.return_empty_normal_batches
    }

    pub fn trace_mut(&mut self) -> Option<&mut ProfileTrace> {
        self.trace.as_mut()
    }

    pub(crate) fn take_trace(&mut self) -> Option<ProfileTrace> {
        self.trace.take()
    }
}
