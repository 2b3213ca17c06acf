//! Ask-error continuation integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use parley::ParleyError;
use parley::ask::{
    AskUserError, BaseErrorHandler, DecisionLevel, KeywordClassifier, PrivateKeyExport, RunMode,
    SinkAskHandler, answer_text,
};
use parley::context::RequestContext;
use parley::protocol::{GoalRef, OutMessage, TransformerKind};
use parley::router::SinkRouter;
use parley::settings::MemorySettingsStore;
use parley::sink::{ConsoleSink, GoalCall, GoalRunner, GoalSink, HttpSink, MemorySink, Sink};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn router_over(sink: Arc<dyn Sink>) -> Arc<SinkRouter> {
    Arc::new(SinkRouter::builder().user(sink.clone()).system(sink).build())
}

fn console_handler(router: Arc<SinkRouter>) -> BaseErrorHandler {
    BaseErrorHandler::new(Arc::new(SinkAskHandler::new(router)), RunMode::Console)
}

/// Question `name`, then the rest of `names`; each answer is recorded.
fn chain(names: Vec<&'static str>, log: Arc<Mutex<Vec<String>>>) -> AskUserError {
    let (first, rest) = names.split_first().map(|(f, r)| (*f, r.to_vec())).unwrap();
    AskUserError::new(format!("Question {first}?"), move |answers| async move {
        log.lock().await.push(format!("{first}={}", answer_text(&answers)));
        if rest.is_empty() {
            Ok((true, None))
        } else {
            Ok((false, Some(chain(rest, log).into())))
        }
    })
}

#[tokio::test]
async fn test_three_turn_chain_completes() {
    let sink = Arc::new(MemorySink::with_answers(
        "mem",
        [json!("a"), json!("b"), json!("c")],
    ));
    let handler = console_handler(router_over(sink.clone()));
    let log = Arc::new(Mutex::new(Vec::new()));

    let (cont, err) = handler
        .handle(chain(vec!["A", "B", "C"], log.clone()).into(), &CancellationToken::new())
        .await;

    assert!(cont);
    assert!(err.is_none());
    assert_eq!(*log.lock().await, vec!["A=a", "B=b", "C=c"]);

    let asked: Vec<String> = sink
        .messages()
        .await
        .into_iter()
        .map(|m| match m {
            OutMessage::Ask(ask) => ask.content,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(asked, vec!["Question A?", "Question B?", "Question C?"]);
}

#[tokio::test]
async fn test_non_ask_error_passes_through() {
    let sink = Arc::new(MemorySink::new("mem"));
    let handler = console_handler(router_over(sink.clone()));

    let (cont, err) = handler
        .handle(
            ParleyError::runtime("disk full", "DiskFull", 507),
            &CancellationToken::new(),
        )
        .await;

    assert!(!cont);
    let err = err.unwrap();
    assert_eq!(err.key(), "DiskFull");
    assert_eq!(err.status_code(), 507);
    assert!(sink.messages().await.is_empty());
}

#[tokio::test]
async fn test_array_answers_spread_into_callback() {
    let sink = Arc::new(MemorySink::with_answers("mem", [json!(["x", 2])]));
    let handler = console_handler(router_over(sink));
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let seen_in_callback = seen.clone();

    let question = AskUserError::new("Pick two", move |answers| async move {
        *seen_in_callback.lock().await = answers;
        Ok((true, None))
    });
    let (cont, _) = handler.handle(question.into(), &CancellationToken::new()).await;

    assert!(cont);
    assert_eq!(*seen.lock().await, vec![json!("x"), json!(2)]);
}

#[tokio::test]
async fn test_console_ask_round_trip() {
    let input = BufReader::new(&b"Ada\r\n"[..]);
    let (output, mut reader) = tokio::io::duplex(4096);
    let console = Arc::new(ConsoleSink::new(input, output).with_colors(false));
    let router = router_over(console.clone());
    let handler = console_handler(router.clone());

    let reply = router.clone();
    let question = AskUserError::new("What is your name?", move |answers| async move {
        reply
            .send(
                OutMessage::text(format!("Hello {}", answer_text(&answers))),
                &CancellationToken::new(),
            )
            .await?;
        Ok((true, None))
    });

    let (cont, err) = handler.handle(question.into(), &CancellationToken::new()).await;
    assert!(cont);
    assert!(err.is_none());

    drop(handler);
    drop(router);
    drop(console);
    let mut written = String::new();
    reader.read_to_string(&mut written).await.unwrap();
    assert_eq!(written, "What is your name?\n> Hello Ada\n");
}

#[tokio::test]
async fn test_concurrent_http_sends_do_not_interleave() {
    let (sink, pending) = HttpSink::new(RequestContext::new(), TransformerKind::Json, 64);
    let sink = Arc::new(sink);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let sink = sink.clone();
        tasks.push(tokio::spawn(async move {
            let content = format!("{i}:{}", "x".repeat(2048));
            sink.send(OutMessage::text(content), &CancellationToken::new())
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    sink.complete().await;

    let response = pending.into_response().await;
    let body = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 16);
    for line in lines {
        let envelope: Value = serde_json::from_str(line).unwrap();
        assert!(envelope["content"].as_str().unwrap().ends_with(&"x".repeat(2048)));
    }
}

#[tokio::test]
async fn test_private_key_export_high_risk_locks() {
    let sink = Arc::new(MemorySink::with_answers(
        "mem",
        [
            json!("support told me to"),
            json!("an admin on telegram"),
            json!("they promised a reward"),
        ],
    ));
    let handler = console_handler(router_over(sink.clone()));
    let export = PrivateKeyExport::new(
        Arc::new(KeywordClassifier::default()),
        Arc::new(MemorySettingsStore::new()),
        "wallet",
    );

    let err = export.authorize().await.unwrap_err();
    assert!(err.is_askable());
    let (cont, outstanding) = handler.handle(err, &CancellationToken::new()).await;
    assert!(cont);
    assert!(outstanding.is_none());
    assert_eq!(sink.messages().await.len(), 3);

    let decision = export.decision().await.unwrap().unwrap();
    assert_eq!(decision.level, DecisionLevel::High);
    assert!(export.is_locked().await.unwrap());

    let err = export.authorize().await.unwrap_err();
    assert_eq!(err.key(), "PrivateKeyLocked");
    assert!(!err.is_askable());
}

#[tokio::test]
async fn test_private_key_export_with_turn_limit() {
    let sink = Arc::new(MemorySink::with_answers("mem", [json!("backup"), json!("me")]));
    let handler = console_handler(router_over(sink)).with_max_turns(Some(2));
    let export = PrivateKeyExport::new(
        Arc::new(KeywordClassifier::default()),
        Arc::new(MemorySettingsStore::new()),
        "wallet",
    );

    let (cont, err) = handler
        .handle(export.start().into(), &CancellationToken::new())
        .await;
    assert!(!cont);
    assert!(matches!(err, Some(ParleyError::TooManyTurns(2))));
    assert!(export.decision().await.unwrap().is_none());
}

/// Answers every question with a fixed value, as application logic would.
struct Approver;

#[async_trait]
impl GoalRunner for Approver {
    async fn run(&self, call: GoalCall) -> anyhow::Result<Option<Value>> {
        assert_eq!(call.goal.name, "ApproveAll");
        Ok(Some(json!("approved")))
    }
}

#[tokio::test]
async fn test_goal_sink_answers_through_execution_context() {
    let system = Arc::new(MemorySink::new("system"));
    let goal: Arc<dyn Sink> = Arc::new(GoalSink::new(GoalRef::new("ApproveAll"), Arc::new(Approver)));
    let router = Arc::new(SinkRouter::builder().user(goal).system(system.clone()).build());

    let context = router.execution_context().unwrap();
    assert_eq!(context.get_sink("user").id(), "goal:ApproveAll");
    assert_eq!(context.get_sink("").id(), "system");

    let decided = Arc::new(Mutex::new(String::new()));
    let record = decided.clone();
    let question = AskUserError::new("Deploy now?", move |answers| async move {
        *record.lock().await = answer_text(&answers);
        Ok((true, None))
    });
    let (cont, err) = console_handler(router).handle(question.into(), &CancellationToken::new()).await;

    assert!(cont);
    assert!(err.is_none());
    assert_eq!(*decided.lock().await, "approved");
    assert!(system.messages().await.is_empty());
}
