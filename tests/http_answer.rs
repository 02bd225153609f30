use ai_governor::answer::{AnswerService, HttpAnswerConfig, HttpAnswerService};
use ai_governor::Error;
use mockito::{Matcher, Server};
use serde_json::json;
use std::time::Duration;

fn completion(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
    .to_string()
}

#[tokio::test]
async fn test_answer_from_chat_completions() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer upstream-key")
        .match_body(Matcher::PartialJson(json!({
            "model": "rag-model",
            "messages": [{ "role": "user", "content": "what is the SMF?" }]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("The SMF manages PDU sessions."))
        .create_async()
        .await;

    let service = HttpAnswerService::new(
        HttpAnswerConfig::new(format!("{}/", server.url()))
            .with_model("rag-model")
            .with_api_key("upstream-key")
            .with_timeout(Duration::from_secs(5)),
    )
    .unwrap();

    let answer = service.answer("what is the SMF?").await.unwrap();
    assert_eq!(answer, "The SMF manages PDU sessions.");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_error_status_becomes_downstream_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body("model loading")
        .create_async()
        .await;

    let service = HttpAnswerService::new(HttpAnswerConfig::new(server.url())).unwrap();
    match service.answer("q").await.unwrap_err() {
        Error::Downstream { message, status } => {
            assert_eq!(status, Some(503));
            assert!(message.contains("model loading"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_empty_choices_is_an_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices": []}"#)
        .create_async()
        .await;

    let service = HttpAnswerService::new(HttpAnswerConfig::new(server.url())).unwrap();
    let err = service.answer("q").await.unwrap_err();
    assert!(matches!(err, Error::Downstream { .. }));
}

#[tokio::test]
async fn test_unreachable_service_is_downstream_error() {
    // nothing listens on port 9 in the test environment
    let service = HttpAnswerService::new(
        HttpAnswerConfig::new("http://127.0.0.1:9").with_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let err = service.answer("q").await.unwrap_err();
    assert!(matches!(err, Error::Downstream { status: None, .. }));
}
