#![allow(dead_code)]

//! Scripted query engine for integration tests. Terms are JSON objects:
//!
//! - `{"datum": v}` evaluates to `v`
//! - `{"grouped": [[group, reduction], ...]}` evaluates to grouped data
//! - `{"range": n}` is a bounded sequence of `0..n` that materializes
//! - `{"table": n}` streams `0..n`, honouring the batch row limit
//! - `{"empty_stream": true}` streams nothing and never reports exhaustion
//! - `{"feed": kind, "batches": [[...], ...]}` replays batches, then waits
//! - `{"error": msg, "at": [step, ...]}` fails evaluation at a located frame
//! - `{"generic_error": msg}` fails evaluation without a frame
//! - `{"compile_error": msg, "at": [step, ...]}` fails preprocessing
//! - `{"bad_datum": msg}` fails compilation without a frame
//! - `{"pending": true}` never finishes evaluating
//! - `{"unsupported": type}` evaluates to a result the cache cannot return

use async_trait::async_trait;
use querycache::query::backtrace::{BacktraceRegistry, BacktraceStep, FrameId};
use querycache::query::batch::{BatchSpec, FeedType};
use querycache::query::error::{CompileError, EvalError};
use querycache::query::grouped::GroupedData;
use querycache::query::{
    CompiledTerm, Datum, DatumStream, EvalEnv, QueryCompiler, RawTerm, Value, VarScope,
};
use querycache::{CacheConfig, QueryCache, QueryParams, QueryType, ServerContext};
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const FRAME_KEY: &str = "$frame";

#[derive(Debug, Default)]
pub struct ScriptedCompiler {
    pub compiled: AtomicUsize,
}

impl QueryCompiler for ScriptedCompiler {
    fn preprocess(
        &self,
        term: &mut RawTerm,
        bt_reg: &mut BacktraceRegistry,
    ) -> Result<(), CompileError> {
        let Some(object) = term.as_object_mut() else {
            return Err(CompileError::Datum(format!("Expected an object term, got {term}.")));
        };
        let frame = register_path(bt_reg, object.get("at"));
        if let Some(message) = object.get("compile_error").and_then(Datum::as_str) {
            return Err(CompileError::query(message, Some(frame)));
        }
        object.insert(FRAME_KEY.into(), json!(frame.index()));
        Ok(())
    }

    fn compile(
        &self,
        scope: &VarScope,
        term: &RawTerm,
    ) -> Result<Box<dyn CompiledTerm>, CompileError> {
        assert!(scope.is_empty(), "top-level terms compile in an empty scope");
        if let Some(message) = term.get("bad_datum").and_then(Datum::as_str) {
            return Err(CompileError::Datum(message.to_string()));
        }
        self.compiled.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ScriptedTerm(term.clone())))
    }
}

fn register_path(bt_reg: &mut BacktraceRegistry, path: Option<&Datum>) -> FrameId {
    let mut frame = bt_reg.root();
    for step in path.and_then(Datum::as_array).into_iter().flatten() {
        let step = match step {
            Datum::Number(n) => BacktraceStep::Index(n.as_u64().unwrap_or(0) as usize),
            other => BacktraceStep::Key(other.as_str().unwrap_or_default().to_string()),
        };
        frame = bt_reg.new_frame(frame, step);
    }
    frame
}

struct ScriptedTerm(RawTerm);

#[async_trait]
impl CompiledTerm for ScriptedTerm {
    async fn eval(&self, _env: &mut EvalEnv) -> Result<Value, EvalError> {
        let term = &self.0;
        if let Some(datum) = term.get("datum") {
            return Ok(Value::Datum(datum.clone()));
        }
        if let Some(groups) = term.get("grouped").and_then(Datum::as_array) {
            return Ok(Value::Grouped(
                groups
                    .iter()
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect::<GroupedData>(),
            ));
        }
        if let Some(n) = term.get("range").and_then(Datum::as_u64) {
            return Ok(Value::Sequence(Box::new(RowStream::bounded(n))));
        }
        if let Some(n) = term.get("table").and_then(Datum::as_u64) {
            return Ok(Value::Sequence(Box::new(RowStream::unbounded(n))));
        }
        if term.get("empty_stream").is_some() {
            return Ok(Value::Sequence(Box::new(FeedStream::new(
                FeedType::NotFeed,
                VecDeque::new(),
            ))));
        }
        if let Some(kind) = term.get("feed").and_then(Datum::as_str) {
            let feed_type = match kind {
                "point" => FeedType::Point,
                "order_by_limit" => FeedType::OrderByLimit,
                "unioned" => FeedType::Unioned,
                _ => FeedType::Stream,
            };
            let batches = term
                .get("batches")
                .and_then(Datum::as_array)
                .map(|batches| {
                    batches
                        .iter()
                        .map(|batch| batch.as_array().cloned().unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default();
            return Ok(Value::Sequence(Box::new(FeedStream::new(feed_type, batches))));
        }
        if let Some(message) = term.get("error").and_then(Datum::as_str) {
            let frame = term
                .get(FRAME_KEY)
                .and_then(Datum::as_u64)
                .map(|index| FrameId::from_index(index as usize));
            return Err(EvalError::query(message, frame));
        }
        if let Some(message) = term.get("generic_error").and_then(Datum::as_str) {
            return Err(EvalError::generic(message));
        }
        if term.get("pending").is_some() {
            return std::future::pending().await;
        }
        if let Some(kind) = term.get("unsupported").and_then(Datum::as_str) {
            let kind: &'static str = match kind {
                "FUNCTION" => "FUNCTION",
                _ => "TABLE",
            };
            return Ok(Value::Other(kind));
        }
        Err(EvalError::generic(format!("unscripted term {term}")))
    }
}

/// `0..total`, in order.
struct RowStream {
    next: u64,
    total: u64,
    materializable: bool,
}

impl RowStream {
    fn bounded(total: u64) -> Self {
        Self {
            next: 0,
            total,
            materializable: true,
        }
    }

    fn unbounded(total: u64) -> Self {
        Self {
            next: 0,
            total,
            materializable: false,
        }
    }
}

#[async_trait]
impl DatumStream for RowStream {
    async fn next_batch(
        &mut self,
        _env: &mut EvalEnv,
        spec: BatchSpec,
    ) -> Result<Vec<Datum>, EvalError> {
        let end = (self.next + spec.max_rows as u64).min(self.total);
        let batch = (self.next..end).map(|n| json!(n)).collect();
        self.next = end;
        Ok(batch)
    }

    fn is_exhausted(&self) -> bool {
        self.next >= self.total
    }

    async fn as_array(&mut self, env: &mut EvalEnv) -> Result<Option<Vec<Datum>>, EvalError> {
        if !self.materializable {
            return Ok(None);
        }
        if self.total as usize > env.config().array_limit {
            return Err(EvalError::generic("Array over size limit."));
        }
        let rows = (self.next..self.total).map(|n| json!(n)).collect();
        self.next = self.total;
        Ok(Some(rows))
    }

    fn feed_type(&self) -> FeedType {
        FeedType::NotFeed
    }
}

/// Replays scripted batches, then blocks until interrupted.
struct FeedStream {
    feed_type: FeedType,
    batches: VecDeque<Vec<Datum>>,
}

impl FeedStream {
    fn new(feed_type: FeedType, batches: VecDeque<Vec<Datum>>) -> Self {
        Self { feed_type, batches }
    }
}

#[async_trait]
impl DatumStream for FeedStream {
    async fn next_batch(
        &mut self,
        _env: &mut EvalEnv,
        _spec: BatchSpec,
    ) -> Result<Vec<Datum>, EvalError> {
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None if !self.feed_type.is_feed() => Ok(Vec::new()),
            None => std::future::pending().await,
        }
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    async fn as_array(&mut self, _env: &mut EvalEnv) -> Result<Option<Vec<Datum>>, EvalError> {
        Ok(None)
    }

    fn feed_type(&self) -> FeedType {
        self.feed_type
    }
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:28015".parse().expect("client addr")
}

pub fn small_batches() -> CacheConfig {
    CacheConfig {
        batch_max_rows: 4,
        first_batch_scaledown: 2,
        ..CacheConfig::default()
    }
}

pub fn context_with(config: CacheConfig) -> Arc<ServerContext> {
    ServerContext::new(config, Arc::new(ScriptedCompiler::default())).expect("server context")
}

pub fn open_cache(config: CacheConfig) -> Arc<QueryCache> {
    QueryCache::with_config_defaults(context_with(config), client_addr())
}

pub fn start(cache: &QueryCache, token: i64, term: Datum) -> QueryParams {
    QueryParams::new(cache, token, QueryType::Start).with_term(term)
}

pub fn continue_(cache: &QueryCache, token: i64) -> QueryParams {
    QueryParams::new(cache, token, QueryType::Continue)
}

pub fn stop(cache: &QueryCache, token: i64) -> QueryParams {
    QueryParams::new(cache, token, QueryType::Stop)
}

/// Lets spawned entry-destruction tasks run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
