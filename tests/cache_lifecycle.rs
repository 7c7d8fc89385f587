mod common;

use common::{continue_, open_cache, settle, small_batches, start};
use querycache::query::backtrace::Backtrace;
use querycache::{
    CacheConfig, CacheError, EntryState, QueryParams, QueryType, Response, ResponseNote,
    ResponseType,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn atom_query_answers_once_and_is_reclaimed() {
    let cache = open_cache(CacheConfig::default());
    let interruptor = CancellationToken::new();

    let mut params = start(&cache, 1, json!({"datum": {"a": 1}}));
    let mut handle = cache.create(&mut params, &interruptor).await.expect("create");
    assert!(!params.holds_query_id());
    assert_eq!(handle.state(), EntryState::Start);

    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessAtom));
    assert_eq!(res.data(), &[json!({"a": 1})]);
    assert!(res.profile().is_none());
    assert_eq!(handle.state(), EntryState::Done);

    assert!(cache.contains(1));
    drop(handle);
    assert!(!cache.contains(1));

    let err = cache
        .get(&mut continue_(&cache, 1), &interruptor)
        .await
        .expect_err("reclaimed token is unknown");
    assert_eq!(err.to_string(), "Token 1 not in stream cache.");
}

#[tokio::test]
async fn get_on_never_created_token_is_client_error() {
    let cache = open_cache(CacheConfig::default());
    let err = cache
        .get(&mut continue_(&cache, 42), &CancellationToken::new())
        .await
        .expect_err("unknown token");
    let res = Response::from_error(&err).expect("client visible");
    assert_eq!(res.response_type(), Some(ResponseType::ClientError));
    assert_eq!(res.data(), &[json!("Token 42 not in stream cache.")]);
}

#[tokio::test]
async fn duplicate_create_is_rejected_while_tracked() {
    let cache = open_cache(small_batches());
    let interruptor = CancellationToken::new();

    let mut handle = cache
        .create(&mut start(&cache, 7, json!({"table": 10})), &interruptor)
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("first batch");
    drop(handle);
    assert_eq!(cache.tokens(), vec![7]);

    let err = cache
        .create(&mut start(&cache, 7, json!({"datum": 1})), &interruptor)
        .await
        .expect_err("duplicate");
    assert_eq!(err.to_string(), "ERROR: duplicate token 7");
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn bounded_sequence_materializes_into_one_atom() {
    let cache = open_cache(CacheConfig::default());
    let mut handle = cache
        .create(&mut start(&cache, 1, json!({"range": 3})), &CancellationToken::new())
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessAtom));
    assert_eq!(res.data(), &[json!([0, 1, 2])]);
    assert_eq!(handle.state(), EntryState::Done);
    drop(handle);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn unbounded_sequence_streams_partial_batches_until_exhausted() {
    let cache = open_cache(small_batches());
    let interruptor = CancellationToken::new();

    let mut handle = cache
        .create(&mut start(&cache, 3, json!({"table": 10})), &interruptor)
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("first batch");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessPartial));
    assert_eq!(res.data(), &[json!(0), json!(1)]);
    assert!(res.notes().is_empty());
    assert_eq!(handle.state(), EntryState::Stream);
    drop(handle);
    assert!(cache.contains(3));

    let mut handle = cache
        .get(&mut continue_(&cache, 3), &interruptor)
        .await
        .expect("continue");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("second batch");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessPartial));
    assert_eq!(res.data(), &[json!(2), json!(3), json!(4), json!(5)]);
    drop(handle);

    let mut handle = cache
        .get(&mut continue_(&cache, 3), &interruptor)
        .await
        .expect("continue");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("last batch");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessSequence));
    assert_eq!(res.data(), &[json!(6), json!(7), json!(8), json!(9)]);
    assert!(res.is_final());
    drop(handle);

    let err = cache
        .get(&mut continue_(&cache, 3), &interruptor)
        .await
        .expect_err("consumed");
    assert!(matches!(err, CacheError::Client { .. }));
}

#[tokio::test]
async fn empty_batch_from_plain_stream_is_final() {
    let cache = open_cache(CacheConfig::default());
    let mut handle = cache
        .create(
            &mut start(&cache, 1, json!({"empty_stream": true})),
            &CancellationToken::new(),
        )
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessSequence));
    assert!(res.data().is_empty());
    assert_eq!(handle.state(), EntryState::Done);
    drop(handle);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn feed_keeps_streaming_through_empty_batches() {
    let cache = open_cache(CacheConfig::default());
    let interruptor = CancellationToken::new();
    let term = json!({"feed": "point", "batches": [[{"new_val": 1}], [], [{"new_val": 2}]]});

    let mut handle = cache
        .create(&mut start(&cache, 9, term), &interruptor)
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("first");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessPartial));
    assert_eq!(res.notes(), &[ResponseNote::AtomFeed]);
    drop(handle);

    let mut handle = cache
        .get(&mut continue_(&cache, 9), &interruptor)
        .await
        .expect("continue");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("empty batch");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessPartial));
    assert!(res.data().is_empty());
    assert_eq!(handle.state(), EntryState::Stream);
    drop(handle);

    let mut handle = cache
        .get(&mut continue_(&cache, 9), &interruptor)
        .await
        .expect("continue");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("third");
    assert_eq!(res.data(), &[json!({"new_val": 2})]);
    drop(handle);
    assert!(cache.contains(9));
}

#[tokio::test]
async fn noreply_stream_finishes_after_first_batch() {
    let cache = open_cache(small_batches());
    let mut params = start(&cache, 5, json!({"table": 100})).with_noreply(true);
    let mut handle = cache
        .create(&mut params, &CancellationToken::new())
        .await
        .expect("create");
    assert!(handle.noreply());
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessSequence));
    drop(handle);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn grouped_result_is_sent_as_pseudotype() {
    let cache = open_cache(CacheConfig::default());
    let mut handle = cache
        .create(
            &mut start(&cache, 1, json!({"grouped": [["a", 2], ["b", 3]]})),
            &CancellationToken::new(),
        )
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    assert_eq!(res.response_type(), Some(ResponseType::SuccessAtom));
    assert_eq!(
        res.data(),
        &[json!({"$reql_type$": "GROUPED_DATA", "data": [["a", 2], ["b", 3]]})]
    );
}

#[tokio::test]
async fn grouped_result_over_array_limit_is_runtime_error() {
    let config = CacheConfig {
        array_limit: 1,
        ..CacheConfig::default()
    };
    let cache = open_cache(config);
    let mut handle = cache
        .create(
            &mut start(&cache, 1, json!({"grouped": [["a", 2], ["b", 3]]})),
            &CancellationToken::new(),
        )
        .await
        .expect("create");
    let err = handle
        .fill_response(&mut Response::new())
        .await
        .expect_err("over limit");
    assert!(matches!(err, CacheError::Runtime { .. }));
    assert_eq!(handle.state(), EntryState::Done);
}

#[tokio::test]
async fn unsupported_result_is_runtime_error_and_reclaimed() {
    let cache = open_cache(CacheConfig::default());
    let mut handle = cache
        .create(
            &mut start(&cache, 1, json!({"unsupported": "FUNCTION"})),
            &CancellationToken::new(),
        )
        .await
        .expect("create");
    let err = handle
        .fill_response(&mut Response::new())
        .await
        .expect_err("unsupported");
    assert_eq!(
        err.to_string(),
        "Query result must be of type DATUM, GROUPED_DATA, or STREAM (got FUNCTION)."
    );
    assert_eq!(err.backtrace(), Some(&Backtrace::empty()));
    drop(handle);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn evaluation_fault_carries_resolved_backtrace() {
    let cache = open_cache(CacheConfig::default());
    let mut handle = cache
        .create(
            &mut start(&cache, 1, json!({"error": "Index out of bounds.", "at": ["args", 0]})),
            &CancellationToken::new(),
        )
        .await
        .expect("create");
    let err = handle
        .fill_response(&mut Response::new())
        .await
        .expect_err("eval fault");
    let res = Response::from_error(&err).expect("client visible");
    assert_eq!(res.response_type(), Some(ResponseType::RuntimeError));
    assert_eq!(res.data(), &[json!("Index out of bounds.")]);
    assert_eq!(
        res.backtrace().expect("backtrace").to_datum(),
        json!(["args", 0])
    );

    let err = handle
        .fill_response(&mut Response::new())
        .await
        .expect_err("already done");
    assert_eq!(err.to_string(), "ERROR: duplicate token 1");
}

#[tokio::test]
async fn compile_faults_never_enter_the_table() {
    let cache = open_cache(CacheConfig::default());
    let interruptor = CancellationToken::new();

    let err = cache
        .create(
            &mut start(&cache, 1, json!({"compile_error": "Unknown term.", "at": [1]})),
            &interruptor,
        )
        .await
        .expect_err("compile error");
    let res = Response::from_error(&err).expect("client visible");
    assert_eq!(res.response_type(), Some(ResponseType::CompileError));
    assert_eq!(res.backtrace().expect("backtrace").to_datum(), json!([1]));

    let err = cache
        .create(&mut start(&cache, 1, json!({"bad_datum": "Bad number."})), &interruptor)
        .await
        .expect_err("datum error");
    assert!(matches!(err, CacheError::Compile { .. }));
    assert_eq!(err.backtrace(), Some(&Backtrace::empty()));

    assert!(cache.is_empty());
    assert_eq!(cache.metrics().created_total, 0);
}

#[tokio::test]
async fn profiled_query_attaches_trace() {
    let cache = open_cache(small_batches());
    let mut optargs = serde_json::Map::new();
    optargs.insert("profile".into(), json!(true));
    let mut params = start(&cache, 1, json!({"table": 10}))
        .with_global_optargs(optargs)
        .expect("optargs");
    assert!(params.profile());

    let mut handle = cache
        .create(&mut params, &CancellationToken::new())
        .await
        .expect("create");
    let mut res = Response::new();
    handle.fill_response(&mut res).await.expect("fill");
    let profile = res.profile().expect("profile").as_array().expect("events").clone();
    let descriptions: Vec<_> = profile.iter().map(|e| e["description"].clone()).collect();
    assert_eq!(descriptions, vec![json!("Evaluate query."), json!("Read batch.")]);
}

#[tokio::test]
async fn abandoned_handle_is_reclaimed() {
    let cache = open_cache(CacheConfig::default());
    let handle = cache
        .create(&mut start(&cache, 1, json!({"datum": 1})), &CancellationToken::new())
        .await
        .expect("create");
    drop(handle);
    assert!(cache.is_empty());
    settle().await;
    let metrics = cache.metrics();
    assert_eq!(metrics.created_total, 1);
    assert_eq!(metrics.terminated_total, 1);
    assert_eq!(metrics.destroyed_total, 1);
}

#[tokio::test]
async fn jobs_describe_tracked_queries() {
    let cache = open_cache(small_batches());
    let interruptor = CancellationToken::new();
    for token in [4, 2] {
        let mut handle = cache
            .create(&mut start(&cache, token, json!({"table": 10})), &interruptor)
            .await
            .expect("create");
        handle.fill_response(&mut Response::new()).await.expect("fill");
    }

    let jobs = cache.jobs();
    assert_eq!(jobs.iter().map(|j| j.token).collect::<Vec<_>>(), vec![2, 4]);
    assert!(jobs.iter().all(|j| j.state == EntryState::Stream));
    assert!(jobs.iter().all(|j| j.client_addr == common::client_addr()));
    assert_ne!(jobs[0].job_id, jobs[1].job_id);
    assert_eq!(cache.context().jobs().len(), 2);

    let encoded = serde_json::to_value(&jobs[0]).expect("serialize");
    assert_eq!(encoded["state"], json!("stream"));
    assert_eq!(encoded["token"], json!(2));
}

#[tokio::test]
async fn params_decode_from_wire_envelope() {
    let cache = open_cache(CacheConfig::default());
    let params = QueryParams::from_json(
        &cache,
        11,
        &json!([1, {"datum": 1}, {"noreply": true, "db": "test"}]),
    )
    .expect("decode");
    assert_eq!(params.query_type(), QueryType::Start);
    assert!(params.noreply());
    assert!(!params.profile());
    assert!(params.holds_query_id());

    let err = QueryParams::from_json(&cache, 12, &json!([1])).expect_err("start needs a term");
    assert!(matches!(err, CacheError::Client { .. }));
    let err = QueryParams::from_json(&cache, 13, &json!([2, null, {"profile": "yes"}]))
        .expect_err("profile must be bool");
    assert_eq!(err.to_string(), "Expected `profile` to be a BOOL, but found STRING.");
    assert!(QueryParams::from_json(&cache, 14, &json!([9])).is_err());
    assert!(QueryParams::from_json(&cache, 15, &json!({"t": 1})).is_err());
}
