//! Integration tests for the chat client: the agent loop, approvals,
//! client-side tools, cancellation and error reporting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use turnstile::agent_loop::{approval_policy, ApprovalDecision, ChatClient, CycleOutcome};
use turnstile::connection::ChannelConnection;
use turnstile::error::TurnstileError;
use turnstile::tools::{ToolDefinition, ToolRegistry};
use turnstile::types::{
    ChunkEvent, FinishReason, Role, ToolCallPhase, APPROVAL_REQUESTED, TOOL_INPUT_AVAILABLE,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn approval_requested(call_id: &str, tool: &str) -> ChunkEvent {
    ChunkEvent::Custom {
        name: APPROVAL_REQUESTED.to_string(),
        data: json!({
            "toolCallId": call_id,
            "toolName": tool,
            "input": {},
            "approval": {"id": format!("approval_{call_id}"), "needsApproval": true}
        }),
    }
}

fn input_available(call_id: &str, tool: &str, input: serde_json::Value) -> ChunkEvent {
    ChunkEvent::Custom {
        name: TOOL_INPUT_AVAILABLE.to_string(),
        data: json!({"toolCallId": call_id, "toolName": tool, "input": input}),
    }
}

fn phase(chat: &ChatClient, call_id: &str) -> ToolCallPhase {
    chat.messages().find_tool_call(call_id).unwrap().state
}

// ---------------------------------------------------------------------------
// Plain turns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn text_turn_appends_user_and_assistant_messages() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::text("Hel"),
        ChunkEvent::text("lo"),
        ChunkEvent::done(FinishReason::Stop),
    ]);

    let finished = Arc::new(Mutex::new(Vec::new()));
    let loading = Arc::new(Mutex::new(Vec::new()));
    let chat = ChatClient::new(connection.clone())
        .on_finish({
            let finished = finished.clone();
            move |message| finished.lock().unwrap().push(message.text())
        })
        .on_loading_change({
            let loading = loading.clone();
            move |flag| loading.lock().unwrap().push(flag)
        });

    let outcome = chat.send_message("Hi").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 1,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    let messages = chat.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages.as_slice()[0].role, Role::User);
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    assert_eq!(messages.last().unwrap().text(), "Hello");
    assert_eq!(*finished.lock().unwrap(), vec!["Hello".to_string()]);
    assert_eq!(*loading.lock().unwrap(), vec![true, false]);
    assert!(!chat.is_loading());

    let requests = connection.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].text(), "Hi");
}

#[tokio::test]
async fn reload_replaces_trailing_assistant_reply() {
    let connection = ChannelConnection::new();
    connection.respond_with([ChunkEvent::text("first"), ChunkEvent::done(FinishReason::Stop)]);
    connection.respond_with([ChunkEvent::text("second"), ChunkEvent::done(FinishReason::Stop)]);
    let chat = ChatClient::new(connection.clone());

    chat.send_message("Hi").await.unwrap();
    chat.reload().await.unwrap();

    let messages = chat.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages.last().unwrap().text(), "second");
    assert_eq!(connection.requests()[1].messages.len(), 1);
}

#[tokio::test]
async fn reload_without_messages_is_skipped() {
    let chat = ChatClient::new(ChannelConnection::new());
    assert_eq!(chat.reload().await.unwrap(), CycleOutcome::Skipped);
}

#[tokio::test]
async fn body_is_sent_with_every_connect() {
    let connection = ChannelConnection::new();
    connection.respond_with([ChunkEvent::done(FinishReason::Stop)]);
    let chat = ChatClient::new(connection.clone()).with_body(json!({"model": "small"}));

    chat.send_message("Hi").await.unwrap();

    assert_eq!(connection.requests()[0].data, Some(json!({"model": "small"})));
}

// ---------------------------------------------------------------------------
// Tool calls and the agent loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_results_and_approvals_resume_only_when_all_terminal() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "delete_file", "{}"),
        approval_requested("call_1", "delete_file"),
        ChunkEvent::tool_start(1, "call_2", "lookup", "{\"q\":1}"),
        input_available("call_2", "lookup", json!({"q": 1})),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    let chat = ChatClient::new(connection.clone());

    let outcome = chat.send_message("clean up").await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::AwaitingTools {
            iterations: 1,
            pending: vec!["call_1".to_string(), "call_2".to_string()],
        }
    );
    assert_eq!(phase(&chat, "call_1"), ToolCallPhase::ApprovalRequested);
    assert_eq!(phase(&chat, "call_2"), ToolCallPhase::InputComplete);

    let outcome = chat
        .add_tool_approval_response("approval_call_1", false)
        .await
        .unwrap();
    assert_eq!(outcome, CycleOutcome::Skipped);
    assert_eq!(phase(&chat, "call_1"), ToolCallPhase::ApprovalResponded);
    assert_eq!(connection.requests().len(), 1);

    connection.respond_with([ChunkEvent::text("done"), ChunkEvent::done(FinishReason::Stop)]);
    let outcome = chat
        .add_tool_result("call_2", json!({"hits": 3}), None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 1,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    assert_eq!(phase(&chat, "call_2"), ToolCallPhase::OutputAvailable);
    let requests = connection.requests();
    assert_eq!(requests.len(), 2);
    let sent_call = requests[1].messages[1].tool_call("call_1").unwrap();
    assert_eq!(sent_call.approval.as_ref().unwrap().approved, Some(false));
    assert_eq!(chat.messages().last().unwrap().text(), "done");
}

#[tokio::test]
async fn late_tool_call_id_replaces_the_placeholder_part() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_delta(0, "{"),
        ChunkEvent::tool_start(0, "call_1", "lookup", "}"),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    let chat = ChatClient::new(connection.clone());

    let outcome = chat.send_message("look it up").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::AwaitingTools {
            iterations: 1,
            pending: vec!["call_1".to_string()],
        }
    );
    let last = chat.messages().last().cloned().unwrap();
    let calls: Vec<_> = last.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].name, "lookup");
    assert_eq!(calls[0].arguments, "{}");
    assert_eq!(calls[0].state, ToolCallPhase::InputComplete);

    connection.respond_with([ChunkEvent::done(FinishReason::Stop)]);
    chat.add_tool_result("call_1", json!({"hits": 1}), None)
        .await
        .unwrap();

    assert_eq!(connection.requests().len(), 2);
}

#[tokio::test]
async fn result_recorded_mid_stream_continues_after_the_stream() {
    let connection = ChannelConnection::new();
    let responder = connection.respond();
    responder.send(ChunkEvent::tool_start(0, "call_1", "lookup", "{}"));
    responder.send(input_available("call_1", "lookup", json!({})));
    let chat = Arc::new(ChatClient::new(connection.clone()));

    let task = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("look it up").await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while chat.messages().find_tool_call("call_1").map(|c| c.state)
            != Some(ToolCallPhase::InputComplete)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let mid = chat
        .add_tool_result("call_1", json!({"hits": 2}), None)
        .await
        .unwrap();
    assert_eq!(mid, CycleOutcome::Skipped);

    connection.respond_with([ChunkEvent::text("two hits"), ChunkEvent::done(FinishReason::Stop)]);
    responder.send(ChunkEvent::done(FinishReason::ToolCalls));
    drop(responder);
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 2,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    assert_eq!(connection.requests().len(), 2);
    assert_eq!(phase(&chat, "call_1"), ToolCallPhase::OutputAvailable);
    assert_eq!(chat.messages().last().unwrap().text(), "two hits");
}

#[tokio::test]
async fn client_tools_run_automatically_and_loop_continues() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "get_location", "{}"),
        input_available("call_1", "get_location", json!({})),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    connection.respond_with([ChunkEvent::text("You are in Oslo"), ChunkEvent::done(FinishReason::Stop)]);

    let tools = ToolRegistry::new().with(ToolDefinition::client(
        "get_location",
        "Where the user is",
        |_| async { Ok(json!({"city": "Oslo"})) },
    ));
    let chat = ChatClient::new(connection.clone()).with_tools(tools);

    let outcome = chat.send_message("where am I?").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 2,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    let call = chat.messages().find_tool_call("call_1").cloned().unwrap();
    assert_eq!(call.state, ToolCallPhase::OutputAvailable);
    assert_eq!(call.output, Some(json!({"city": "Oslo"})));
    assert_eq!(connection.requests().len(), 2);
    assert_eq!(chat.messages().len(), 3);
}

#[tokio::test]
async fn failing_client_tool_records_output_error() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "flaky", "{}"),
        input_available("call_1", "flaky", json!({})),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    connection.respond_with([ChunkEvent::done(FinishReason::Stop)]);

    let tools = ToolRegistry::new().with(ToolDefinition::client("flaky", "Fails", |_| async {
        Err(TurnstileError::tool("flaky", "device offline"))
    }));
    let chat = ChatClient::new(connection.clone()).with_tools(tools);

    chat.send_message("go").await.unwrap();

    let call = chat.messages().find_tool_call("call_1").cloned().unwrap();
    assert_eq!(call.state, ToolCallPhase::OutputError);
    assert!(call.error.unwrap().contains("device offline"));
    assert_eq!(connection.requests().len(), 2);
}

#[tokio::test]
async fn approval_handler_answers_and_deferred_requests_wait() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "read_file", "{}"),
        approval_requested("call_1", "read_file"),
        ChunkEvent::tool_start(1, "call_2", "rm", "{}"),
        approval_requested("call_2", "rm"),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    let chat = ChatClient::new(connection.clone()).with_approval_handler(approval_policy(|request| {
        if request.tool_name == "read_file" {
            ApprovalDecision::Approve
        } else {
            ApprovalDecision::Defer
        }
    }));

    let outcome = chat.send_message("tidy").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::AwaitingTools {
            iterations: 1,
            pending: vec!["call_2".to_string()],
        }
    );
    assert_eq!(phase(&chat, "call_1"), ToolCallPhase::ApprovalResponded);
    assert_eq!(phase(&chat, "call_2"), ToolCallPhase::ApprovalRequested);
}

#[tokio::test]
async fn continuation_strategy_bounds_the_loop() {
    let connection = ChannelConnection::new();
    for i in 0..3 {
        let id = format!("call_{i}");
        connection.respond_with([
            ChunkEvent::tool_start(0, id.clone(), "tick", "{}"),
            input_available(&id, "tick", json!({})),
            ChunkEvent::done(FinishReason::ToolCalls),
        ]);
    }
    let tools = ToolRegistry::new().with(ToolDefinition::client("tick", "Tick", |_| async {
        Ok(json!("ok"))
    }));
    let chat = ChatClient::new(connection.clone())
        .with_tools(tools)
        .with_continuation(turnstile::agent_loop::max_iterations(2));

    let outcome = chat.send_message("loop").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 2,
            finish_reason: Some(FinishReason::ToolCalls),
        }
    );
    assert_eq!(connection.requests().len(), 2);
}

#[tokio::test]
async fn iteration_bound_restarts_on_resume() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "lookup", "{}"),
        input_available("call_1", "lookup", json!({})),
        ChunkEvent::done(FinishReason::ToolCalls),
    ]);
    connection.respond_with([ChunkEvent::text("found"), ChunkEvent::done(FinishReason::Stop)]);
    let chat = ChatClient::new(connection.clone())
        .with_continuation(turnstile::agent_loop::max_iterations(1));

    let outcome = chat.send_message("look it up").await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::AwaitingTools {
            iterations: 1,
            pending: vec!["call_1".to_string()],
        }
    );

    let outcome = chat
        .add_tool_result("call_1", json!({"hits": 1}), None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 1,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    assert_eq!(connection.requests().len(), 2);
}

#[tokio::test]
async fn server_executed_tools_do_not_trigger_another_cycle() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::tool_start(0, "call_1", "weather", "{\"city\":\"Oslo\"}"),
        ChunkEvent::ToolCallEnd {
            id: "call_1".to_string(),
            input: None,
            result: Some("{\"temp\":4}".to_string()),
        },
        ChunkEvent::text("It is 4 degrees."),
        ChunkEvent::done(FinishReason::Stop),
    ]);
    let chat = ChatClient::new(connection.clone());

    let outcome = chat.send_message("weather?").await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Finished {
            iterations: 1,
            finish_reason: Some(FinishReason::Stop),
        }
    );
    let last = chat.messages().last().cloned().unwrap();
    assert_eq!(last.tool_call("call_1").unwrap().state, ToolCallPhase::OutputAvailable);
    assert_eq!(last.tool_results().count(), 1);
    assert_eq!(last.text(), "It is 4 degrees.");
    assert_eq!(connection.requests().len(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation and errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_keeps_partial_text_and_reports_cancelled() {
    let connection = ChannelConnection::new();
    let responder = connection.respond();
    responder.send(ChunkEvent::text("Hel"));
    let chat = Arc::new(ChatClient::new(connection.clone()));

    let task = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("Hi").await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while chat.messages().last().map(|m| m.text()) != Some("Hel".to_string()) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert!(chat.stop());
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome, CycleOutcome::Cancelled);
    assert_eq!(chat.messages().last().unwrap().text(), "Hel");
    assert!(!chat.is_loading());
    assert_eq!(chat.error(), None);
    assert!(!chat.stop());
}

#[tokio::test]
async fn concurrent_request_is_rejected() {
    let connection = ChannelConnection::new();
    let responder = connection.respond();
    let chat = Arc::new(ChatClient::new(connection.clone()));

    let task = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("first").await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while connection.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let err = chat.send_message("second").await.unwrap_err();
    assert!(matches!(err, TurnstileError::InvalidState(_)));

    responder.send(ChunkEvent::done(FinishReason::Stop));
    drop(responder);
    task.await.unwrap().unwrap();
    assert_eq!(chat.messages().len(), 2);
}

#[tokio::test]
async fn error_chunk_sets_error_and_next_request_clears_it() {
    let connection = ChannelConnection::new();
    connection.respond_with([
        ChunkEvent::text("partial"),
        ChunkEvent::Error {
            message: "overloaded".to_string(),
            code: Some("529".to_string()),
        },
    ]);
    connection.respond_with([ChunkEvent::text("ok"), ChunkEvent::done(FinishReason::Stop)]);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let chat = ChatClient::new(connection.clone()).on_error({
        let errors = errors.clone();
        move |err| errors.lock().unwrap().push(err.to_string())
    });

    let err = chat.send_message("Hi").await.unwrap_err();
    assert!(matches!(err, TurnstileError::Stream { .. }));
    assert_eq!(chat.error(), Some("Stream error: overloaded".to_string()));
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(chat.messages().last().unwrap().text(), "partial");
    assert!(!chat.is_loading());

    chat.send_message("again").await.unwrap();
    assert_eq!(chat.error(), None);
}

#[tokio::test]
async fn connect_failure_is_reported_without_assistant_message() {
    let chat = ChatClient::new(ChannelConnection::new());

    let err = chat.send_message("Hi").await.unwrap_err();

    assert!(matches!(err, TurnstileError::Transport(_)));
    assert_eq!(chat.messages().len(), 1);
    assert!(chat.error().is_some());
}

#[tokio::test]
async fn clear_forgets_messages_and_error() {
    let chat = ChatClient::new(ChannelConnection::new());
    let _ = chat.send_message("Hi").await;

    chat.clear();

    assert!(chat.messages().is_empty());
    assert_eq!(chat.error(), None);
}
