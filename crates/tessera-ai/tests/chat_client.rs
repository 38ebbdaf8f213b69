use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tessera_ai::{
    AbortController, ChatClient, ChatErrorCode, ChatMessage, ChatOptions, Chunk, ClientConfig,
    ErrorCategory, ProviderError, RetryPolicy, ScriptStep, ScriptedAttempt, ScriptedProvider,
    ToolCall, ToolCallFragment, WireFormat,
};
use tokio::time::Instant;

fn client(provider: &Arc<ScriptedProvider>) -> ChatClient {
    ChatClient::with_provider(provider.clone(), ClientConfig::default()).expect("valid config")
}

fn user_turn() -> Vec<ChatMessage> {
    vec![ChatMessage::user("What is x?")]
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) -> Result<(), tessera_ai::CallbackError> + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |fragment: &str| {
        sink.lock().expect("recorder lock").push(fragment.to_string());
        Ok(())
    })
}

fn rate_limited() -> ScriptedAttempt {
    ScriptedAttempt::Reject(ProviderError::Http {
        status: 429,
        message: "Too Many Requests".to_string(),
    })
}

fn stream_of(steps: Vec<ScriptStep>) -> ScriptedAttempt {
    ScriptedAttempt::Stream(steps)
}

#[tokio::test]
async fn assembles_interleaved_content_and_tool_call() {
    let provider = Arc::new(ScriptedProvider::from_chunks(vec![
        Chunk::text("Hel"),
        Chunk::text("lo"),
        Chunk::tool_call(ToolCallFragment::start(0, "a1", "lookup").with_arguments("{\"q\":")),
        Chunk::tool_call(ToolCallFragment::arguments(0, "\"x\"}")),
    ]));
    let (seen, callback) = recorder();

    let response = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m").on_content(callback))
        .await
        .expect("stream assembles");

    assert_eq!(response.content, "Hello");
    assert_eq!(
        response.tool_calls,
        vec![ToolCall {
            id: "a1".to_string(),
            function_name: "lookup".to_string(),
            arguments: "{\"q\":\"x\"}".to_string(),
        }]
    );
    assert_eq!(*seen.lock().expect("recorder lock"), vec!["Hel", "lo"]);
    assert_eq!(response.metadata_value("provider"), Some(&json!("scripted")));
    assert_eq!(response.metadata_value("model"), Some(&json!("m")));
    assert_eq!(response.metadata_value("attempts"), Some(&json!(1)));
    assert_eq!(provider.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_establishment_is_retried_with_backoff() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        rate_limited(),
        rate_limited(),
        stream_of(vec![ScriptStep::Chunk(Chunk::text("finally"))]),
    ]));
    let started = Instant::now();

    let response = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m"))
        .await
        .expect("third attempt succeeds");

    let waited = started.elapsed().as_millis();
    assert!((2_699..=3_305).contains(&waited), "waited {waited}ms");
    assert_eq!(response.content, "finally");
    assert_eq!(response.metadata_value("attempts"), Some(&json!(3)));
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_streaming_returns_timeout_with_partial() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![
        ScriptStep::Chunk(Chunk::text("partial")),
        ScriptStep::Delay(Duration::from_secs(10)),
        ScriptStep::Chunk(Chunk::text(" never")),
    ])]));
    let (seen, callback) = recorder();

    let error = client(&provider)
        .send_chat(
            &user_turn(),
            ChatOptions::new("m")
                .with_timeout_ms(1_000)
                .on_content(callback),
        )
        .await
        .expect_err("deadline expires");

    assert_eq!(error.code, ChatErrorCode::Timeout);
    assert_eq!(error.category, ErrorCategory::Network);
    assert_eq!(
        error.partial.as_ref().map(|partial| partial.content.as_str()),
        Some("partial")
    );
    assert_eq!(*seen.lock().expect("recorder lock"), vec!["partial"]);
    assert_eq!(provider.releases(), 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_times_out_at_deadline_and_releases_once() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![
        ScriptStep::Stall,
    ])]));
    let started = Instant::now();

    let error = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m").with_timeout_ms(1_000))
        .await
        .expect_err("stalled stream hits the deadline");
    let elapsed = started.elapsed();

    assert_eq!(error.code, ChatErrorCode::Timeout);
    assert!(
        elapsed >= Duration::from_millis(1_000) && elapsed < Duration::from_millis(1_050),
        "elapsed {elapsed:?}"
    );
    let partial = error.partial.expect("streaming timeout carries a partial");
    assert!(partial.content.is_empty());
    assert!(partial.tool_calls.is_empty());
    assert_eq!(provider.releases(), 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_establishment_has_no_partial() {
    let provider = Arc::new(
        ScriptedProvider::from_chunks(vec![Chunk::text("late")])
            .with_establish_delay(Duration::from_secs(30)),
    );

    let error = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m").with_timeout_ms(2_000))
        .await
        .expect_err("establishment too slow");

    assert!(error.is_timeout());
    assert!(error.partial.is_none());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_cuts_backoff_short() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedAttempt::Reject(
        ProviderError::Http {
            status: 503,
            message: "unavailable".to_string(),
        },
    )]));
    let started = Instant::now();

    let error = client(&provider)
        .send_chat(
            &user_turn(),
            ChatOptions::new("m")
                .with_timeout_ms(1_500)
                .with_retry_policy(RetryPolicy::default().initial_delay_ms(5_000).max_delay_ms(5_000)),
        )
        .await
        .expect_err("backoff exceeds deadline");

    assert!(error.is_timeout());
    assert_eq!(provider.calls(), 1);
    assert!(started.elapsed() < Duration::from_millis(1_600));
}

#[tokio::test]
async fn authentication_rejection_fails_after_one_attempt() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedAttempt::Reject(
        ProviderError::Http {
            status: 401,
            message: "bad key".to_string(),
        },
    )]));

    let error = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m"))
        .await
        .expect_err("unauthorized");

    assert_eq!(error.category, ErrorCategory::Authentication);
    assert!(!error.retryable);
    assert_eq!(error.attempts, Some(1));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn mid_stream_failure_is_not_retried_and_keeps_partial_state() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![
        ScriptStep::Chunk(Chunk::text("half an ans")),
        ScriptStep::Chunk(Chunk::tool_call(
            ToolCallFragment::start(2, "c1", "search").with_arguments("{\"term\":"),
        )),
        ScriptStep::Fail(ProviderError::Transport("read ECONNRESET".to_string())),
    ])]));

    let error = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m"))
        .await
        .expect_err("stream interrupted");

    assert_eq!(error.code, ChatErrorCode::StreamInterrupted);
    assert_eq!(error.category, ErrorCategory::Network);
    assert!(error.retryable);
    assert_eq!(provider.calls(), 1);
    let partial = error.partial.expect("partial state");
    assert_eq!(partial.content, "half an ans");
    assert_eq!(partial.tool_calls[0].arguments, "{\"term\":");
    assert_eq!(provider.releases(), 1);
}

#[tokio::test]
async fn failure_on_first_item_is_not_retried_either() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![ScriptStep::Fail(
        ProviderError::Transport("socket hang up".to_string()),
    )])]));

    let error = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m"))
        .await
        .expect_err("first item fails");

    assert_eq!(error.code, ChatErrorCode::ProviderTransport);
    assert_eq!(provider.calls(), 1);
    assert_eq!(error.partial.map(|partial| partial.content), Some(String::new()));
}

#[tokio::test]
async fn callback_failure_stops_the_call_and_releases_the_stream() {
    let provider = Arc::new(ScriptedProvider::from_chunks(vec![
        Chunk::text("one"),
        Chunk::text("two"),
        Chunk::text("three"),
    ]));
    let mut delivered = 0;

    let error = client(&provider)
        .send_chat(
            &user_turn(),
            ChatOptions::new("m").on_content(move |_| {
                delivered += 1;
                if delivered == 2 {
                    Err("terminal went away".into())
                } else {
                    Ok(())
                }
            }),
        )
        .await
        .expect_err("callback fails");

    assert_eq!(error.code, ChatErrorCode::CallbackFailed);
    assert_eq!(
        error.partial.map(|partial| partial.content).as_deref(),
        Some("onetwo")
    );
    assert_eq!(provider.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn external_abort_cancels_a_stalled_stream() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![
        ScriptStep::Chunk(Chunk::text("so far")),
        ScriptStep::Stall,
    ])]));
    let controller = AbortController::new();
    let aborter = controller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        aborter.abort();
    });

    let error = client(&provider)
        .send_chat(
            &user_turn(),
            ChatOptions::new("m").with_abort_signal(controller.signal()),
        )
        .await
        .expect_err("cancelled");

    assert!(error.is_cancelled());
    assert_eq!(error.category, ErrorCategory::Client);
    assert!(!error.retryable);
    assert_eq!(
        error.partial.map(|partial| partial.content).as_deref(),
        Some("so far")
    );
    assert_eq!(provider.releases(), 1);
    assert!(!controller.abort());
}

#[tokio::test]
async fn already_aborted_signal_never_reaches_the_provider() {
    let provider = Arc::new(ScriptedProvider::from_chunks(vec![Chunk::text("x")]));
    let controller = AbortController::new();
    controller.abort();

    let error = client(&provider)
        .send_chat(
            &user_turn(),
            ChatOptions::new("m").with_abort_signal(controller.signal()),
        )
        .await
        .expect_err("cancelled up front");

    assert!(error.is_cancelled());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn invalid_inputs_fail_fast_without_a_provider_call() {
    let provider = Arc::new(ScriptedProvider::from_chunks(vec![Chunk::text("x")]));
    let client = client(&provider);

    let cases = vec![
        (user_turn(), ChatOptions::new("")),
        (Vec::new(), ChatOptions::new("m")),
        (vec![ChatMessage::new(" ", "hi")], ChatOptions::new("m")),
        (user_turn(), ChatOptions::new("m").with_timeout_ms(10)),
        (user_turn(), ChatOptions::new("m").with_timeout_ms(3_600_000)),
        (
            user_turn(),
            ChatOptions::new("m").with_retry_policy(RetryPolicy::default().max_attempts(0)),
        ),
    ];
    for (messages, options) in cases {
        let error = client
            .send_chat(&messages, options)
            .await
            .expect_err("invalid input");
        assert_eq!(error.code, ChatErrorCode::InvalidRequest);
        assert_eq!(error.category, ErrorCategory::Client);
        assert!(!error.retryable);
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn openai_shaped_items_are_normalized_before_assembly() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![stream_of(vec![
            ScriptStep::Json(json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]})),
            ScriptStep::Json(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "id": "call_b", "function": {"name": "b", "arguments": "{}"}},
                {"index": 0, "id": "call_a", "function": {"name": "a", "arguments": "{"}}
            ]}}]})),
            ScriptStep::Json(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "}"}}
            ]}, "finish_reason": "tool_calls"}]})),
            ScriptStep::Json(json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 4}})),
        ])])
        .with_id("openai")
        .with_wire_format(WireFormat::OpenAiChat),
    );

    let response = client(&provider)
        .send_chat(&user_turn(), ChatOptions::new("m"))
        .await
        .expect("normalized stream");

    assert_eq!(response.content, "Hi");
    let names = response
        .tool_calls
        .iter()
        .map(|call| (call.function_name.as_str(), call.arguments.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(names, vec![("a", "{}"), ("b", "{}")]);
    assert_eq!(response.metadata_value("finishReason"), Some(&json!("tool_calls")));
    assert_eq!(
        response.metadata_value("usage"),
        Some(&json!({"inputTokens": 3, "outputTokens": 4}))
    );
    assert_eq!(response.metadata_value("provider"), Some(&json!("openai")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_keep_independent_state() {
    let provider = Arc::new(ScriptedProvider::new(vec![stream_of(vec![
        ScriptStep::Chunk(Chunk::text("a")),
        ScriptStep::Delay(Duration::from_millis(20)),
        ScriptStep::Chunk(Chunk::tool_call(
            ToolCallFragment::start(0, "t", "tool").with_arguments("{}"),
        )),
        ScriptStep::Chunk(Chunk::text("b")),
    ])]));
    let client = client(&provider);

    let handles = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let (seen, callback) = recorder();
                let response = client
                    .send_chat(&user_turn(), ChatOptions::new("m").on_content(callback))
                    .await
                    .expect("concurrent call");
                let seen = seen.lock().expect("recorder lock").clone();
                (response, seen)
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        let (response, seen) = handle.await.expect("task joined");
        assert_eq!(response.content, "ab");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(seen, vec!["a", "b"]);
    }
    assert_eq!(provider.calls(), 4);
    assert_eq!(provider.releases(), 4);
    assert_eq!(client.provider_id(), "scripted");
}
