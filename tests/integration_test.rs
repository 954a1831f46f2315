use quectoflow::api::ReqwestApiClient;
use quectoflow::config::Config;
use quectoflow::provider::http::HTTPProvider;
use quectoflow::tool::{FnTool, ToolRegistry};
use quectoflow::workflow::loader::load_document;
use quectoflow::workflow::{Context, SchemaValidator, WorkflowError, WorkflowExecutor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    })
}

fn provider(server: &MockServer) -> Arc<HTTPProvider> {
    Arc::new(
        HTTPProvider::new(
            "test-key".into(),
            server.uri(),
            None,
            "gpt-4o-mini".into(),
            Duration::from_secs(10),
        )
        .unwrap()
        .with_retries(0, 0),
    )
}

fn api_client() -> Arc<ReqwestApiClient> {
    Arc::new(ReqwestApiClient::new(Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_lead_pipeline_end_to_end() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/leads"))
        .and(query_param("query", "dentists in Austin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "leads": [{"name": "Bright Smiles"}, {"name": "Lone Star Dental"}],
            "total": 2,
            "cursor": "abc"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_string_contains("Summarise 2 leads for dentists in Austin"))
        .and(body_partial_json(json!({"messages": [{"role": "system"}, {"role": "user"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "```json\n{\"summary\": \"Two practices found\", \"priority\": \"high\"}\n```",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let enriched = Arc::new(AtomicUsize::new(0));
    let counter = enriched.clone();
    let registry = ToolRegistry::new();
    registry
        .register(Arc::new(FnTool::new("enrich_lead", move |inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            let name = inputs["lead"]["name"].as_str().unwrap_or_default().to_string();
            Ok(vec![json!(format!("{}@example.com", name.replace(' ', "").to_lowercase()))])
        })))
        .await;
    registry
        .register(Arc::new(FnTool::new("notify_sales", |inputs| {
            Ok(vec![json!(format!("notified about {}", inputs["summary"].as_str().unwrap_or_default()))])
        })))
        .await;

    let executor = WorkflowExecutor::new(
        SchemaValidator::bundled().unwrap(),
        registry,
        api_client(),
        provider(&server),
    );

    let doc = json!({"workflow": {"outputs": ["summary", "email", "notice"], "steps": [
        {"type": "api_call", "parameters": {
            "api": format!("{}/leads", server.uri()),
            "method": "GET",
            "input_keys": ["query"],
            "output_keys": ["leads", "total"]
        }},
        {"type": "for_loop", "parameters": {
            "iterable": "leads", "loop_variable": "lead",
            "body": [{"type": "tool_call", "parameters": {
                "tool": "enrich_lead", "input_keys": ["lead"], "output_keys": ["email"]
            }}]
        }},
        {"type": "llm_call", "parameters": {
            "prompt": "Summarise 2 leads for ${initial_context.query}",
            "system_prompt": "You are a sales assistant.",
            "output_keys": ["summary", "priority"]
        }},
        {"type": "conditional", "parameters": {"conditions": [
            {"condition": "priority == 'high' and total > 1", "next_step": [
                {"type": "tool_call", "parameters": {
                    "tool": "notify_sales", "input_keys": ["summary"], "output_keys": ["notice"]
                }}
            ]}
        ]}}
    ]}});

    let initial = Context::from_value(json!({"query": "dentists in Austin"})).unwrap();
    let report = executor.run(&doc, initial).await.unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(enriched.load(Ordering::SeqCst), 2);
    assert!(!report.context.contains("cursor"));
    assert_eq!(report.context.get("total"), Some(&json!(2)));
    assert_eq!(
        report.outputs().into_value(),
        json!({
            "summary": "Two practices found",
            "email": "lonestardental@example.com",
            "notice": "notified about Two practices found"
        })
    );
}

#[tokio::test]
async fn test_api_server_error_is_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm/contacts"))
        .and(body_partial_json(json!({"email": "a@b.co"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let executor = WorkflowExecutor::new(
        SchemaValidator::bundled().unwrap(),
        ToolRegistry::new(),
        api_client(),
        provider(&server),
    );
    let doc = json!({"steps": [{"type": "api_call", "parameters": {
        "api": format!("{}/crm/contacts", server.uri()),
        "method": "POST",
        "input_keys": ["email"],
        "output_keys": ["contact_id"]
    }}]});

    let initial = Context::from_value(json!({"email": "a@b.co"})).unwrap();
    let report = executor.run(&doc, initial).await.unwrap();

    assert!(!report.context.contains("contact_id"));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "api_call");
    assert!(report.failures[0].error.contains("HTTP 500"));
}

#[tokio::test]
async fn test_llm_error_keeps_history_and_fail_fast_aborts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "context length exceeded"}
        })))
        .mount(&server)
        .await;

    let executor = WorkflowExecutor::new(
        SchemaValidator::bundled().unwrap(),
        ToolRegistry::new(),
        api_client(),
        provider(&server),
    );
    let steps = json!([
        {"type": "llm_call", "parameters": {"prompt": "draft an email", "system_prompt": "be brief"}}
    ]);

    let report = executor
        .run(&json!({"steps": steps}), Context::new())
        .await
        .unwrap();
    assert!(!report.context.contains("response"));
    let failure = &report.failures[0];
    assert!(failure.error.contains("context length exceeded"));
    assert_eq!(failure.messages.len(), 2);
    assert_eq!(failure.messages[0].content, "be brief");

    let err = executor
        .run(
            &json!({"workflow": {"failure_policy": "fail_fast", "steps": steps}}),
            Context::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Step { ref path, .. } if path == "steps[0]"));
}

#[tokio::test]
async fn test_yaml_workflow_from_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello, Acme!")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let wf_path = dir.path().join("greet.yaml");
    std::fs::write(
        &wf_path,
        r#"
workflow:
  steps:
    - type: llm_call
      parameters:
        prompt: "Greet ${initial_context.company}"
        system_prompt: "You write greetings."
"#,
    )
    .unwrap();

    let mut cfg = Config::default();
    cfg.provider.api_key = "test-key".into();
    cfg.provider.api_base = server.uri();
    cfg.provider.model = "gpt-4o".into();
    cfg.provider.max_retries = 0;

    let executor = WorkflowExecutor::from_config(&cfg, ToolRegistry::new()).unwrap();
    let doc = load_document(&wf_path).unwrap();
    let initial = Context::from_value(json!({"company": "Acme"})).unwrap();
    let report = executor.run(&doc, initial).await.unwrap();

    assert_eq!(report.context.get("response"), Some(&json!("Hello, Acme!")));
    assert_eq!(report.context.get("company"), Some(&json!("Acme")));
}

#[tokio::test]
async fn test_invalid_document_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let executor = WorkflowExecutor::new(
        SchemaValidator::bundled().unwrap(),
        ToolRegistry::new(),
        api_client(),
        provider(&server),
    );
    let doc = json!({"workflow": {"steps": [
        {"type": "api_call", "parameters": {"api": format!("{}/x", server.uri()), "method": "GET"}},
        {"type": "api_call", "parameters": {"api": format!("{}/y", server.uri())}}
    ]}});

    let err = executor.run(&doc, Context::new()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Schema { .. }));
}
