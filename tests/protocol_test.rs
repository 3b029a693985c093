//! Wire shapes of the coordinator/worker protocol.

use serde_json::{json, Value};
use snippet_pool::protocol::{
    decode_coordinator_message, decode_worker_message, encode_line, ContextOptions,
    CoordinatorMessage, InitOptions, TaskError, TaskId, Variant, WorkerMessage,
};

fn to_value<T: serde::Serialize>(message: &T) -> Value {
    serde_json::from_str(&encode_line(message).unwrap()).unwrap()
}

#[test]
fn eval_message_shape() {
    let message = CoordinatorMessage::Eval {
        task_id: TaskId::pool(7),
        code: "1 + 1".into(),
        filename: Some("calc.js".into()),
        timeout_ms: Some(250),
    };
    assert_eq!(
        to_value(&message),
        json!({ "type": "eval", "taskId": "task-7", "code": "1 + 1", "filename": "calc.js", "timeoutMs": 250 })
    );
}

#[test]
fn eval_message_omits_unset_fields() {
    let message = CoordinatorMessage::Eval {
        task_id: TaskId::pool(1),
        code: "x".into(),
        filename: None,
        timeout_ms: None,
    };
    assert_eq!(to_value(&message), json!({ "type": "eval", "taskId": "task-1", "code": "x" }));
}

#[test]
fn init_message_shape() {
    let message = CoordinatorMessage::Init(InitOptions {
        context_options: ContextOptions(json!({ "memoryLimit": 64 })),
        variant: Variant::SharedFs,
        shared_fs_mount: Some("/data".into()),
        bootstrap_source: None,
        wasm_location: None,
    });
    assert_eq!(
        to_value(&message),
        json!({
            "type": "init",
            "contextOptions": { "memoryLimit": 64 },
            "variant": "shared-fs",
            "sharedFsMount": "/data",
        })
    );
}

#[test]
fn singlefile_variant_name() {
    assert_eq!(serde_json::to_value(Variant::SingleFile).unwrap(), json!("singlefile"));
}

#[test]
fn control_messages_shape() {
    assert_eq!(to_value(&CoordinatorMessage::Terminate), json!({ "type": "terminate" }));
    assert_eq!(
        to_value(&CoordinatorMessage::Cancel { task_id: TaskId::from("session-1-task-2") }),
        json!({ "type": "cancel", "taskId": "session-1-task-2" })
    );
}

#[test]
fn worker_replies_decode() {
    assert_eq!(decode_worker_message(r#"{"type":"ready"}"#).unwrap(), WorkerMessage::Ready);

    let result = decode_worker_message(r#"{"type":"result","taskId":"task-3","value":[1,2]}"#).unwrap();
    assert_eq!(result, WorkerMessage::Completed { task_id: TaskId::pool(3), value: json!([1, 2]) });
    assert_eq!(result.task_id(), Some(&TaskId::pool(3)));

    let failed = decode_worker_message(
        r#"{"type":"error","taskId":"task-4","error":{"name":"TypeError","message":"x is undefined"}}"#,
    )
    .unwrap();
    let WorkerMessage::Failed { task_id, error } = failed else {
        panic!("expected a failed reply");
    };
    assert_eq!(task_id, TaskId::pool(4));
    assert_eq!(error.name, "TypeError");
    assert!(!error.is_timeout && !error.is_cancelled && !error.is_worker_crash);
}

#[test]
fn init_error_decodes() {
    let message =
        decode_worker_message(r#"{"type":"init-error","error":{"name":"Error","message":"no wasm"}}"#).unwrap();
    assert_eq!(message, WorkerMessage::InitError { error: TaskError::new("Error", "no wasm") });
    assert_eq!(message.task_id(), None);
}

#[test]
fn error_flags_are_camel_case_and_sparse() {
    let plain = serde_json::to_value(TaskError::new("Error", "boom")).unwrap();
    assert_eq!(plain, json!({ "name": "Error", "message": "boom" }));

    let timeout = serde_json::to_value(TaskError::timeout(10)).unwrap();
    assert_eq!(timeout["isTimeout"], json!(true));
    assert!(timeout.get("isCancelled").is_none());

    let crash = serde_json::to_value(TaskError::worker_crash(&TaskId::pool(1), "exit code 1")).unwrap();
    assert_eq!(crash["isWorkerCrash"], json!(true));
}

#[test]
fn coordinator_decode_rejects_worker_messages() {
    assert!(decode_coordinator_message(r#"{"type":"ready"}"#).is_err());
    assert!(decode_coordinator_message(r#"{"taskId":"task-1"}"#).is_err());
    assert!(decode_coordinator_message("not json").is_err());
}

#[test]
fn coordinator_roundtrip_through_decode() {
    let line = encode_line(&CoordinatorMessage::Eval {
        task_id: TaskId::pool(9),
        code: "line one\nline two".into(),
        filename: None,
        timeout_ms: Some(0),
    })
    .unwrap();
    assert!(!line.contains('\n'));
    let decoded = decode_coordinator_message(&line).unwrap();
    assert!(matches!(decoded, CoordinatorMessage::Eval { timeout_ms: Some(0), .. }));
}
