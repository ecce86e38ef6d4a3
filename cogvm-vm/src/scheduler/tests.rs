use super::*;
use crate::error::ErrorKind;
use crate::units::{ComputeKind, ScriptedComputeUnit, ScriptedToolUnit, ToolKind};
use serde_json::json;
use std::time::Duration;

type Vm = Scheduler<ScriptedComputeUnit, ScriptedToolUnit>;

fn program(code: Value) -> Program {
    Program::from_value(json!({"id": "main", "name": "Main", "code": code})).unwrap()
}

fn vm(compute: ScriptedComputeUnit) -> Vm {
    Scheduler::new(VmConfig::default(), compute, ScriptedToolUnit::new())
}

async fn run_program(vm: &mut Vm, code: Value) -> RunOutcome {
    vm.submit(&program(code)).unwrap();
    vm.run().await.unwrap()
}

fn error_kind(outcome: &RunOutcome) -> &str {
    outcome.error.as_ref().map(|e| e.kind.as_str()).unwrap_or("")
}

fn landed_calls(trace: &Trace) -> Vec<String> {
    trace
        .entries()
        .iter()
        .filter_map(|entry| match &entry.event {
            TraceEvent::External { call, .. } => Some(call.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_complete_resolves_result() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "greeting", "data": "hello"},
            {"op": "COMPLETE", "result": {"text": "greeting", "literal": "not a page"}}
        ]),
    )
    .await;

    assert!(outcome.success);
    assert_eq!(outcome.state, TaskState::Done);
    assert_eq!(outcome.value, Some(json!({"text": "hello", "literal": "not a page"})));
    assert_eq!(outcome.steps, 2);
    assert!(!vm.trace().is_empty());
}

#[tokio::test]
async fn test_infer_writes_page() {
    let compute = ScriptedComputeUnit::new().respond("classify", json!("bug"));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "issue", "data": "crash on start"},
            {"op": "INFER", "prompt": "classify", "context": ["issue"], "store_to": "label"},
            {"op": "COMPLETE", "result": "label"}
        ]),
    )
    .await;

    assert_eq!(outcome.value, Some(json!("bug")));
    let calls = vm.compute().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, ComputeKind::Infer);
    assert_eq!(calls[0].context, vec![json!("crash on start")]);
    assert_eq!(landed_calls(vm.trace()), vec!["infer \"classify\"".to_string()]);
}

#[tokio::test]
async fn test_compute_failure_is_a_payload() {
    let compute = ScriptedComputeUnit::new().fail("classify", ErrorKind::RateLimited, "quota");
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "INFER", "prompt": "classify", "store_to": "label"},
            {"op": "BRANCH", "condition": "label.success", "if_true": "ok", "if_false": "failed"},
            {"op": "LABEL", "name": "ok"},
            {"op": "COMPLETE", "result": "unexpected"},
            {"op": "LABEL", "name": "failed"},
            {"op": "COMPLETE", "result": "label"}
        ]),
    )
    .await;

    assert!(outcome.success);
    let payload = outcome.value.unwrap();
    assert_eq!(payload["success"], false);
    assert_eq!(payload["error"], "RateLimited");
    assert_eq!(payload["retryable"], true);
}

#[tokio::test]
async fn test_call_timeout_is_a_payload() {
    let compute = ScriptedComputeUnit::new().respond_after("slow", json!("late"), Duration::from_millis(500));
    let config = VmConfig::default().with_call_timeout(Some(Duration::from_millis(20)));
    let mut vm = Scheduler::new(config, compute, ScriptedToolUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "INFER", "prompt": "slow", "store_to": "r"},
            {"op": "COMPLETE", "result": "r"}
        ]),
    )
    .await;

    assert!(outcome.success);
    let payload = outcome.value.unwrap();
    assert_eq!(payload["success"], false);
    assert_eq!(payload["error"], "Timeout");
}

#[tokio::test]
async fn test_parallel_keeps_declaration_order() {
    let compute = ScriptedComputeUnit::new()
        .respond_after("first", json!("one"), Duration::from_millis(80))
        .respond_after("second", json!("two"), Duration::from_millis(40))
        .respond("third", json!("three"));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "PARALLEL", "store_to": "results", "branches": [
                {"name": "a", "code": [
                    {"op": "INFER", "prompt": "first", "store_to": "p_a"},
                    {"op": "COMPLETE", "result": "p_a"}
                ]},
                {"name": "b", "code": [
                    {"op": "INFER", "prompt": "second", "store_to": "p_b"},
                    {"op": "COMPLETE", "result": "p_b"}
                ]},
                {"name": "c", "code": [
                    {"op": "INFER", "prompt": "third", "store_to": "p_c"},
                    {"op": "COMPLETE", "result": "p_c"}
                ]}
            ]},
            {"op": "COMPLETE", "result": "results"}
        ]),
    )
    .await;

    let results = outcome.value.unwrap();
    let keys: Vec<&String> = results.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["a", "b", "c"]);
    assert_eq!(results["a"], json!({"success": true, "value": "one"}));
    assert_eq!(results["c"], json!({"success": true, "value": "three"}));

    // Completion order was the reverse of declaration order
    let landed = landed_calls(vm.trace());
    assert_eq!(landed.len(), 3);
    assert!(landed[0].contains("third"));
    assert!(landed[2].contains("first"));

    // Joined children are collected
    assert_eq!(vm.state().tasks().count(), 1);
}

#[tokio::test]
async fn test_failed_child_does_not_fail_parent() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "PARALLEL", "store_to": "r", "branches": [
                {"name": "good", "code": [{"op": "COMPLETE", "result": 1}]},
                {"name": "bad", "code": [{"op": "FAIL", "error": "boom"}]}
            ]},
            {"op": "ASSERT", "condition": "r.good.success"},
            {"op": "ASSERT", "condition": "!r.bad.success"},
            {"op": "COMPLETE", "result": "r.bad.error"}
        ]),
    )
    .await;

    assert!(outcome.success);
    let error = outcome.value.unwrap();
    assert_eq!(error["kind"], "Fail");
    assert_eq!(error["message"], "boom");
    assert_eq!(error["program"], "main/bad");
}

#[tokio::test]
async fn test_assert_failure_surfaces_as_run_error() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "check", "data": {"ok": false}},
            {"op": "ASSERT", "condition": "check.ok", "message": "check did not pass"}
        ]),
    )
    .await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, TaskState::Failed);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, "AssertionFailed");
    assert_eq!(error.message, "check did not pass");
    assert_eq!(error.pc, Some(1));
}

#[tokio::test]
async fn test_join_unknown_task() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(&mut vm, json!([{"op": "JOIN", "tasks": ["ghost"], "store_to": "r"}])).await;

    assert!(!outcome.success);
    assert_eq!(error_kind(&outcome), "UnknownTask");
}

#[tokio::test]
async fn test_join_through_stored_ids() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "SPAWN", "opcode": {"op": "STORE", "page_id": "x", "data": 1}, "store_to": "first"},
            {"op": "SPAWN", "opcode": {"op": "STORE", "page_id": "y", "data": 2}},
            {"op": "POP_TO", "store_to": "second"},
            {"op": "JOIN", "tasks": ["first", "second"], "store_to": "joined"},
            {"op": "COMPLETE", "result": "joined"}
        ]),
    )
    .await;

    assert_eq!(
        outcome.value,
        Some(json!({
            "task_1": {"success": true, "value": 1},
            "task_2": {"success": true, "value": 2}
        }))
    );
}

#[tokio::test]
async fn test_mutual_join_deadlocks() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "SPAWN", "id": "waiter",
             "opcode": {"op": "JOIN", "tasks": ["task_0"], "store_to": "w"}},
            {"op": "JOIN", "tasks": ["waiter"], "store_to": "done"},
            {"op": "COMPLETE", "result": "done"}
        ]),
    )
    .await;

    assert!(!outcome.success);
    assert_eq!(error_kind(&outcome), "Deadlock");
    let waiter = vm.task(&TaskId::from("waiter")).unwrap();
    assert_eq!(waiter.state, TaskState::Failed);
    assert_eq!(waiter.error.as_ref().unwrap().kind, "Deadlock");
}

#[tokio::test]
async fn test_inject_splices_after_itself() {
    let compute = ScriptedComputeUnit::new()
        .respond("write more", json!([{"op": "STORE", "page_id": "x", "data": 5}]))
        .respond(
            "fenced",
            json!("```json\n{\"code\": [{\"op\": \"STORE\", \"page_id\": \"y\", \"data\": 6}]}\n```"),
        );
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "INJECT", "goal": "write more", "store_to": "report"},
            {"op": "INJECT", "goal": "fenced"},
            {"op": "COMPLETE", "result": {"x": "x", "y": "y", "report": "report"}}
        ]),
    )
    .await;

    assert_eq!(
        outcome.value,
        Some(json!({"x": 5, "y": 6, "report": {"success": true, "injected": 1}}))
    );
}

#[tokio::test]
async fn test_invalid_injection_fails_task() {
    let compute = ScriptedComputeUnit::new().respond("bad", json!("not code at all"));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "INJECT", "goal": "bad"},
            {"op": "COMPLETE", "result": "unreachable"}
        ]),
    )
    .await;

    assert!(!outcome.success);
    assert_eq!(error_kind(&outcome), "InvalidInjection");
}

#[tokio::test]
async fn test_infer_batch_pages() {
    let compute = ScriptedComputeUnit::new()
        .respond_after("a", json!("A"), Duration::from_millis(30))
        .respond("b", json!("B"));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "INFER_BATCH", "prompts": ["a", "b", "c"], "store_prefix": "r", "store_combined": "all"},
            {"op": "COMPLETE", "result": ["r_0", "r_1", "all"]}
        ]),
    )
    .await;

    let value = outcome.value.unwrap();
    assert_eq!(value[0], "A");
    assert_eq!(value[1], "B");
    assert_eq!(value[2]["count"], 3);
    assert_eq!(value[2]["success"], false);
    assert_eq!(value[2]["results"][2]["response"]["error"], "InvalidResponse");
    assert_eq!(vm.page("r_2").unwrap()["success"], false);
    assert_eq!(vm.compute().calls().len(), 3);
}

#[tokio::test]
async fn test_tool_results() {
    let tools = ScriptedToolUnit::new()
        .respond_path(ToolKind::ReadFile, "notes.md", json!({"success": true, "data": "hi"}))
        .respond(ToolKind::ListDir, json!("garbage"));
    let mut vm = Scheduler::new(VmConfig::default(), ScriptedComputeUnit::new(), tools);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "target", "data": {"file": "notes.md"}},
            {"op": "READ_FILE", "path": "target.file", "store_to": "content"},
            {"op": "LIST_DIR", "path": ".", "store_to": "listing"},
            {"op": "EXEC", "command": "make", "store_to": "built"},
            {"op": "COMPLETE", "result": {"data": "content.data", "listing": "listing", "built": "built.success"}}
        ]),
    )
    .await;

    let value = outcome.value.unwrap();
    assert_eq!(value["data"], "hi");
    assert_eq!(
        value["listing"],
        json!({"success": false, "error": "malformed tool response", "response": "garbage"})
    );
    assert_eq!(value["built"], false);

    let calls = vm.tools().calls();
    assert_eq!(calls[0].0, ToolKind::ReadFile);
    assert_eq!(calls[0].1["path"], "notes.md");
    assert_eq!(calls[2].1["command"], "make");
}

#[tokio::test]
async fn test_reserved_page_blocks_other_writers() {
    let compute = ScriptedComputeUnit::new().respond_after("produce", json!("from-a"), Duration::from_millis(50));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "SPAWN", "id": "a",
             "opcode": {"op": "INFER", "prompt": "produce", "store_to": "shared"}},
            {"op": "SPAWN", "id": "b",
             "opcode": {"op": "STORE", "page_id": "shared", "data": "from-b"}},
            {"op": "JOIN", "tasks": ["a", "b"], "store_to": "joined"},
            {"op": "COMPLETE", "result": {"shared": "shared", "joined": "joined"}}
        ]),
    )
    .await;

    let value = outcome.value.unwrap();
    assert_eq!(value["joined"]["a"]["value"], "from-a");
    assert_eq!(value["joined"]["b"]["value"], "from-b");
    assert_eq!(value["shared"], "from-b");

    let b = TaskId::from("b");
    let blocked = vm.trace().for_task(&b).any(|entry| {
        matches!(
            entry.event,
            TraceEvent::Transition {
                to: TaskState::Blocked,
                ..
            }
        )
    });
    assert!(blocked);
    assert!(vm.state().locks.is_empty());
}

#[tokio::test]
async fn test_rollback_abandons_newer_tasks() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "keep", "data": 1},
            {"op": "SET_REG", "reg": "thought", "value": "before"},
            {"op": "CHECKPOINT", "name": "c"},
            {"op": "SPAWN", "id": "late", "opcode": {"op": "NOP"}},
            {"op": "STORE", "page_id": "scratch", "data": 2},
            {"op": "SET_REG", "reg": "thought", "value": "after"},
            {"op": "ROLLBACK", "name": "c"},
            {"op": "COMPLETE", "result": {"keep": "keep", "scratch": "scratch", "thought": "thought"}}
        ]),
    )
    .await;

    assert_eq!(
        outcome.value,
        Some(json!({"keep": 1, "scratch": "scratch", "thought": "before"}))
    );
    let late = vm.task(&TaskId::from("late")).unwrap();
    assert_eq!(late.state, TaskState::Failed);
    assert_eq!(late.error.as_ref().unwrap().kind, "Abandoned");
}

#[tokio::test]
async fn test_rollback_to_missing_checkpoint() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let outcome = run_program(&mut vm, json!([{"op": "ROLLBACK", "name": "nowhere"}])).await;
    assert_eq!(error_kind(&outcome), "CheckpointNotFound");
}

#[tokio::test]
async fn test_step_limit() {
    let config = VmConfig::default().with_max_steps(50);
    let mut vm = Scheduler::new(config, ScriptedComputeUnit::new(), ScriptedToolUnit::new());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "LABEL", "name": "top"},
            {"op": "JUMP", "target": "top"}
        ]),
    )
    .await;

    assert_eq!(error_kind(&outcome), "StepLimitExceeded");
    assert_eq!(outcome.steps, 51);
}

#[tokio::test]
async fn test_registers_reach_compute() {
    let compute = ScriptedComputeUnit::new().with_fallback(json!(["read", "fix"]));
    let mut vm = vm(compute);
    vm.set_register(Register::Goal, json!("fix the parser"));
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "PLAN", "goal": "goal", "store_to": "plan"},
            {"op": "SET_REG", "reg": "focus", "value": "plan.0"},
            {"op": "GET_REG", "reg": "focus", "store_to": "f"},
            {"op": "COMPLETE", "result": "f"}
        ]),
    )
    .await;

    assert_eq!(outcome.value, Some(json!("read")));
    let calls = vm.compute().calls();
    assert_eq!(calls[0].kind, ComputeKind::Plan);
    assert_eq!(calls[0].registers["goal"], "fix the parser");
}

#[tokio::test]
async fn test_library_call_and_spawn() {
    let mut vm = vm(ScriptedComputeUnit::new());
    let greet = Program::from_value(json!({
        "id": "greet",
        "name": "Greet",
        "code": [{"op": "RETURN", "value": {"hello": "name"}}]
    }))
    .unwrap();
    vm.register(&greet).unwrap();

    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "CALL", "program_id": "greet", "args": {"name": "world"}},
            {"op": "SPAWN", "program_id": "greet", "args": {"name": "kid"}, "id": "k"},
            {"op": "JOIN", "tasks": ["k"], "store_to": "spawned"},
            {"op": "COMPLETE", "result": {"called": "greet_result", "spawned": "spawned.k.value"}}
        ]),
    )
    .await;

    assert_eq!(
        outcome.value,
        Some(json!({"called": {"hello": "world"}, "spawned": {"hello": "kid"}}))
    );
}

#[tokio::test]
async fn test_eviction_spills_to_storage() {
    let config = VmConfig::default().with_max_pages(2);
    let mut vm = Scheduler::new(config, ScriptedComputeUnit::new(), ScriptedToolUnit::new())
        .with_storage(Storage::memory());
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "a", "data": 1},
            {"op": "STORE", "page_id": "b", "data": 2},
            {"op": "STORE", "page_id": "c", "data": 3},
            {"op": "LOAD_PAGE", "page_id": "a"},
            {"op": "COMPLETE", "result": ["a", "b", "c"]}
        ]),
    )
    .await;

    assert_eq!(outcome.value, Some(json!([1, 2, 3])));
    let memory = vm.state().memory();
    assert!(memory.len() <= 2);
    assert!(memory.contains("a"));
    assert!(!memory.contains("b"));
    assert!(vm.state().storage().has_page("b"));
}

#[tokio::test]
async fn test_yield_interleaves_branches() {
    let mut vm = vm(ScriptedComputeUnit::new());
    run_program(
        &mut vm,
        json!([
            {"op": "PARALLEL", "store_to": "r", "branches": [
                {"name": "a", "code": [
                    {"op": "LOG", "message": "a1"},
                    {"op": "YIELD"},
                    {"op": "LOG", "message": "a2"}
                ]},
                {"name": "b", "code": [
                    {"op": "LOG", "message": "b1"},
                    {"op": "YIELD"},
                    {"op": "LOG", "message": "b2"}
                ]}
            ]},
            {"op": "COMPLETE", "result": "r"}
        ]),
    )
    .await;

    let logged: Vec<&str> = vm
        .trace()
        .entries()
        .iter()
        .filter_map(|entry| match &entry.event {
            TraceEvent::Log { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(logged, ["a1", "b1", "a2", "b2"]);
}

#[tokio::test]
async fn test_unjoined_children_are_reclaimed() {
    let compute = ScriptedComputeUnit::new().respond_after("forever", json!(null), Duration::from_secs(30));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "SPAWN", "id": "bg", "opcode": {"op": "INFER", "prompt": "forever", "store_to": "never"}},
            {"op": "YIELD"},
            {"op": "YIELD"},
            {"op": "COMPLETE", "result": "done"}
        ]),
    )
    .await;

    assert!(outcome.success);
    assert_eq!(vm.compute().calls().len(), 1);
    let bg = vm.task(&TaskId::from("bg")).unwrap();
    assert_eq!(bg.state, TaskState::Failed);
    assert_eq!(bg.error.as_ref().unwrap().kind, "Abandoned");
    assert!(vm.state().locks.is_empty());
}

#[tokio::test]
async fn test_submit_rules() {
    let mut vm = vm(ScriptedComputeUnit::new());
    assert!(vm.run().await.is_err());

    let main = program(json!([{"op": "NOP"}]));
    vm.submit(&main).unwrap();
    let err = vm.submit(&main).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Running off the end completes with null
    let outcome = vm.run().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.value, Some(Value::Null));
}

fn read_then_branch() -> Value {
    json!([
        {"op": "LABEL", "name": "entry"},
        {"op": "READ_FILE", "path": "a.txt", "store_to": "content"},
        {"op": "BRANCH", "condition": "content.success", "if_true": "ok", "if_false": "err"},
        {"op": "LABEL", "name": "ok"},
        {"op": "COMPLETE", "result": {"data": "content.data"}},
        {"op": "LABEL", "name": "err"},
        {"op": "FAIL", "error": "read failed"}
    ])
}

#[tokio::test]
async fn test_read_file_success_path() {
    let tools = ScriptedToolUnit::new().respond(ToolKind::ReadFile, json!({"success": true, "data": "hi"}));
    let mut vm = Scheduler::new(VmConfig::default(), ScriptedComputeUnit::new(), tools);
    let outcome = run_program(&mut vm, read_then_branch()).await;

    assert_eq!(outcome.state, TaskState::Done);
    assert_eq!(outcome.value, Some(json!({"data": "hi"})));
}

#[tokio::test]
async fn test_read_file_failure_path() {
    let tools = ScriptedToolUnit::new().respond(ToolKind::ReadFile, json!({"success": false}));
    let mut vm = Scheduler::new(VmConfig::default(), ScriptedComputeUnit::new(), tools);
    let outcome = run_program(&mut vm, read_then_branch()).await;

    assert_eq!(outcome.state, TaskState::Failed);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, "Fail");
    assert_eq!(error.message, "read failed");
}

#[tokio::test]
async fn test_spawned_writers_on_distinct_pages() {
    let compute = ScriptedComputeUnit::new()
        .respond_after("left", json!("L"), Duration::from_millis(30))
        .respond("right", json!("R"));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "SPAWN", "opcode": {"op": "INFER", "prompt": "left", "store_to": "left"}, "store_to": "l"},
            {"op": "SPAWN", "opcode": {"op": "INFER", "prompt": "right", "store_to": "right"}, "store_to": "r"},
            {"op": "JOIN", "tasks": ["l", "r"], "store_to": "joined"},
            {"op": "COMPLETE", "result": ["left", "right"]}
        ]),
    )
    .await;

    assert_eq!(outcome.value, Some(json!(["L", "R"])));
}

#[tokio::test]
async fn test_reply_for_rolled_back_task_is_dropped() {
    let compute = ScriptedComputeUnit::new()
        .respond_after("old", json!("OLD"), Duration::from_millis(50))
        .respond_after("new", json!("NEW"), Duration::from_millis(200));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "CHECKPOINT", "name": "c"},
            {"op": "SPAWN", "id": "bg", "opcode": {"op": "INFER", "prompt": "old", "store_to": "x"}},
            {"op": "YIELD"},
            {"op": "YIELD"},
            {"op": "YIELD"},
            {"op": "ROLLBACK", "name": "c"},
            {"op": "SPAWN", "id": "bg", "opcode": {"op": "INFER", "prompt": "new", "store_to": "y"}},
            {"op": "JOIN", "tasks": ["bg"], "store_to": "joined"},
            {"op": "COMPLETE", "result": {"joined": "joined", "x": "x"}}
        ]),
    )
    .await;

    let value = outcome.value.unwrap();
    assert_eq!(value["joined"]["bg"], json!({"success": true, "value": "NEW"}));
    // The rolled-back write never lands
    assert_eq!(value["x"], "x");
    assert!(vm.page("x").is_none());
    assert_eq!(vm.compute().calls().len(), 2);
    assert_eq!(landed_calls(vm.trace()), vec!["infer \"new\"".to_string()]);
}

#[tokio::test]
async fn test_eviction_spares_pages_of_a_joining_task() {
    let config = VmConfig::default().with_max_pages(4);
    let mut vm = Scheduler::new(config, ScriptedComputeUnit::new(), ScriptedToolUnit::new());
    let writer = Program::from_value(json!({
        "id": "writer",
        "name": "Writer",
        "code": [
            {"op": "STORE", "page_id": "a1", "data": 1},
            {"op": "STORE", "page_id": "a2", "data": 2},
            {"op": "STORE", "page_id": "a3", "data": 3},
            {"op": "STORE", "page_id": "a4", "data": 4},
            {"op": "STORE", "page_id": "a5", "data": 5}
        ]
    }))
    .unwrap();
    vm.register(&writer).unwrap();

    let main = program(json!([
        {"op": "STORE", "page_id": "notes", "data": "keep me"},
        {"op": "STORE", "page_id": "results", "data": "pending"},
        {"op": "SPAWN", "id": "w", "program_id": "writer"},
        {"op": "JOIN", "tasks": ["w"], "store_to": "results"},
        {"op": "COMPLETE", "result": {"results": "results", "focus": "focus"}}
    ]));
    vm.submit_with_args(&main, json!({"focus": "notes"})).unwrap();
    let outcome = vm.run().await.unwrap();

    let value = outcome.value.unwrap();
    assert_eq!(value["results"]["w"]["success"], true);
    assert_eq!(value["focus"], "notes");

    let parent = TaskId::from("task_0");
    let blocked = vm.trace().for_task(&parent).any(|entry| {
        matches!(
            entry.event,
            TraceEvent::Transition {
                to: TaskState::Blocked,
                ..
            }
        )
    });
    assert!(blocked);

    // The JOIN target and the bound page never left the working set
    let state = vm.state();
    assert!(state.memory().contains("notes"));
    assert!(state.memory().contains("results"));
    assert!(!state.storage().has_page("notes"));
    assert!(!state.storage().has_page("results"));
    assert!(state.storage().has_page("a1"));
    assert!(state.memory().len() <= 4);
}

#[tokio::test]
async fn test_reads_wait_for_reserved_page() {
    let compute = ScriptedComputeUnit::new().respond_after("produce", json!("fresh"), Duration::from_millis(40));
    let mut vm = vm(compute);
    let outcome = run_program(
        &mut vm,
        json!([
            {"op": "STORE", "page_id": "shared", "data": "stale"},
            {"op": "SPAWN", "id": "a", "opcode": {"op": "INFER", "prompt": "produce", "store_to": "shared"}},
            {"op": "YIELD"},
            {"op": "YIELD"},
            {"op": "COMPLETE", "result": {"v": "shared"}}
        ]),
    )
    .await;

    assert_eq!(outcome.value, Some(json!({"v": "fresh"})));
    let root = TaskId::from("task_0");
    let waited = vm.trace().for_task(&root).any(|entry| {
        matches!(
            &entry.event,
            TraceEvent::Transition { to: TaskState::Blocked, reason, .. } if reason.contains("shared")
        )
    });
    assert!(waited);
}
