//! End-to-end tests for the script orchestrator

use courier_config::{load_str, ConfigBuilder, ConfigFormat, ScriptingSettings};
use courier_core::{
    Argument, RequestDefinition, ScriptBlock, ScriptDefinition, ScriptingConfig, WorkspaceDefinition,
};
use courier_scripting::prelude::*;
use courier_scripting::DiagnosticKind;
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Weak};

const CONFIG: &str = r#"
active_workspace: a
init:
  lua: boot_count = (boot_count or 0) + 1
scripts:
  noop:
    body:
      lua: local unused = 1
  answer:
    body:
      lua: 6 * 7
  lookup:
    body:
      rhai: |-
        type_of(id) + ":" + id.to_string()
    arguments:
      - name: id
        type: Guid
        required: true
workspaces:
  - name: c
    init:
      lua: order = (order or '') .. 'C'
    pre_request:
      lua: ctx.headers['X-Env'] = workspace.name
    post_response:
      lua: ctx.body .. '|base'
  - name: b
    extend: c
    init:
      lua: order = (order or '') .. 'B'
  - name: a
    extend: b
    init:
      lua: order = (order or '') .. 'A'
    post_response:
      lua: base(ctx) .. '|child'
    scripts:
      greet:
        body:
          lua: "'hi ' .. workspace.name"
    requests:
      login:
        endpoint: /login
        pre_request:
          lua: |-
            ctx.headers['X-Login'] = '1'
            base(ctx)
"#;

fn orchestrator() -> ScriptOrchestrator {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = load_str(CONFIG, ConfigFormat::Yaml).unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();
    orchestrator
}

#[test]
fn test_init_runs_global_then_base_first() {
    let orchestrator = orchestrator();
    assert!(orchestrator.is_initialized());
    assert!(orchestrator.native_enabled());
    assert_eq!(orchestrator.evaluate_dynamic("boot_count").unwrap(), json!(1));
    assert_eq!(orchestrator.evaluate_dynamic("order").unwrap(), json!("CBA"));

    orchestrator.initialize().unwrap();
    orchestrator.activate_workspace("a").unwrap();
    orchestrator.activate_workspace("b").unwrap();
    assert_eq!(orchestrator.evaluate_dynamic("order").unwrap(), json!("CBA"));
    assert_eq!(orchestrator.evaluate_dynamic("boot_count").unwrap(), json!(1));
}

#[test]
fn test_reset_reruns_init() {
    let orchestrator = orchestrator();
    orchestrator.evaluate_dynamic("boot_count = boot_count + 10").unwrap();

    orchestrator.reset_for_reload();
    assert!(!orchestrator.is_initialized());
    assert!(matches!(
        orchestrator.evaluate_dynamic("boot_count"),
        Err(ScriptError::NotInitialized)
    ));

    orchestrator.initialize().unwrap();
    assert_eq!(orchestrator.evaluate_dynamic("boot_count").unwrap(), json!(1));
    assert_eq!(orchestrator.evaluate_dynamic("order").unwrap(), json!("CBA"));
}

#[test]
fn test_inheritance_cycle_completes_with_diagnostic() {
    let mut x = WorkspaceDefinition::new("x").extending("y");
    x.init = ScriptBlock::single("lua", "seen = (seen or '') .. 'x'");
    let mut y = WorkspaceDefinition::new("y").extending("x");
    y.init = ScriptBlock::single("lua", "seen = (seen or '') .. 'y'");
    let config = ConfigBuilder::new().workspace(x).workspace(y).active("x").build().unwrap();

    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();

    assert_eq!(orchestrator.evaluate_dynamic("seen").unwrap(), json!("yx"));
    assert!(orchestrator
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::InheritanceCycle));

    let body = orchestrator
        .invoke_post_response("x", None, &PostResponseContext::new("ok"))
        .unwrap();
    assert_eq!(body, "ok");
}

#[test]
fn test_script_compiles_once() {
    let orchestrator = orchestrator();
    assert_eq!(orchestrator.compile_count(), 0);
    assert_eq!(orchestrator.evaluate_dynamic("workspaces.a.greet()").unwrap(), json!("hi a"));
    assert_eq!(orchestrator.evaluate_dynamic("workspaces.a.greet()").unwrap(), json!("hi a"));
    assert_eq!(orchestrator.call_script(Some("a"), "greet", vec![]).unwrap(), json!("hi a"));
    assert_eq!(orchestrator.compile_count(), 1);
}

#[test]
fn test_root_script_results() {
    let orchestrator = orchestrator();
    assert_eq!(orchestrator.call_script(None, "noop", vec![]).unwrap(), HostValue::Null);
    assert_eq!(orchestrator.call_script(None, "answer", vec![]).unwrap(), json!(42));
    assert_eq!(orchestrator.call_script(Some("b"), "answer", vec![]).unwrap(), json!(42));
    assert!(matches!(
        orchestrator.call_script(None, "missing", vec![]),
        Err(ScriptError::ScriptNotFound(_))
    ));
}

#[test]
fn test_post_response_chain() {
    let orchestrator = orchestrator();
    let body = orchestrator
        .invoke_post_response("a", None, &PostResponseContext::new("<body>"))
        .unwrap();
    assert_eq!(body, "<body>|base|child");

    let body = orchestrator
        .invoke_post_response("a", Some("login"), &PostResponseContext::new("<body>"))
        .unwrap();
    assert_eq!(body, "<body>|base|child");
}

#[test]
fn test_pre_request_chain() {
    let orchestrator = orchestrator();
    let mut ctx = PreRequestContext::new().with_header("Accept", "application/json");
    orchestrator
        .invoke_pre_request("a", Some("login"), &mut ctx)
        .unwrap();
    assert_eq!(ctx.headers["X-Login"], "1");
    assert_eq!(ctx.headers["X-Env"], "c");
    assert_eq!(ctx.headers["Accept"], "application/json");

    let mut ctx = PreRequestContext::new();
    orchestrator.invoke_pre_request("b", None, &mut ctx).unwrap();
    assert!(!ctx.headers.contains_key("X-Login"));
    assert!(matches!(
        orchestrator.invoke_pre_request("nowhere", None, &mut ctx),
        Err(ScriptError::WorkspaceNotFound(_))
    ));
}

#[test]
fn test_native_guid_argument() {
    let orchestrator = orchestrator();
    let guid = "6f9619ff-8b86-d011-b42d-00cf4fc964ff";
    assert_eq!(
        orchestrator.call_script(None, "lookup", vec![json!(guid)]).unwrap(),
        json!(format!("Guid:{guid}"))
    );
    assert_eq!(
        orchestrator
            .evaluate_dynamic(&format!("scripts.lookup('{guid}')"))
            .unwrap(),
        json!(format!("Guid:{guid}"))
    );
    assert_eq!(orchestrator.wrapper_compile_count(), 1);

    let err = orchestrator
        .call_script(None, "lookup", vec![json!("not-a-guid")])
        .unwrap_err();
    match err {
        ScriptError::Conversion { wrapper, value, target, .. } => {
            assert!(wrapper.contains("lookup"));
            assert_eq!(value, "\"not-a-guid\"");
            assert_eq!(target, "Guid");
        }
        other => panic!("expected a conversion error, got {other}"),
    }
}

#[test]
fn test_request_shims_need_executor() {
    let orchestrator = orchestrator();
    assert!(matches!(
        orchestrator.evaluate_dynamic("workspaces.a.login.execute()"),
        Err(ScriptError::MissingExecutor(_))
    ));

    orchestrator.register_request_executor(|workspace, request, args| {
        Ok(json!({ "workspace": workspace, "request": request, "args": args }))
    });
    assert_eq!(
        orchestrator
            .evaluate_dynamic("workspaces.a.requests.login.exec('x').request")
            .unwrap(),
        json!("login")
    );

    orchestrator.reset_for_reload();
    orchestrator.initialize().unwrap();
    assert_eq!(
        orchestrator
            .evaluate_dynamic("workspaces.a.login.execute().workspace")
            .unwrap(),
        json!("a")
    );
}

#[test]
fn test_post_response_merge_rule() {
    let mut native_only = WorkspaceDefinition::new("native-only");
    native_only.post_response = ScriptBlock::single("rhai", r#"this.body + "!native""#);
    let mut both = WorkspaceDefinition::new("both");
    both.post_response = ScriptBlock::single("rhai", r#"this.body + "!native""#).with("lua", "ctx.body .. '!dyn'");
    let config = ConfigBuilder::new()
        .workspace(native_only)
        .workspace(both)
        .build()
        .unwrap();

    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();
    assert!(orchestrator.native_enabled());

    let ctx = PostResponseContext::new("<b>");
    assert_eq!(
        orchestrator.invoke_post_response("native-only", None, &ctx).unwrap(),
        "<b>!native"
    );
    assert_eq!(orchestrator.invoke_post_response("both", None, &ctx).unwrap(), "<b>!dyn");
}

#[test]
fn test_native_session_persists_between_calls() {
    let config = ScriptingConfig {
        init: ScriptBlock::single("native", "let greeting = \"hello\";\nfn shout(s) { s.to_upper() }"),
        ..ScriptingConfig::default()
    };
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();
    assert_eq!(orchestrator.evaluate_native("shout(greeting)").unwrap(), json!("HELLO"));
}

#[test]
fn test_warmup() {
    let orchestrator = orchestrator();
    assert_eq!(orchestrator.warmup(100, false, false), WarmupReport::default());

    let report = orchestrator.warmup(100, true, true);
    assert_eq!(report.namespaces, 3);
    assert_eq!(report.chains, 3);
    assert_eq!(report.compiled, 4);
    assert_eq!(report.failed, 0);

    assert_eq!(orchestrator.wrapper_compile_count(), 1);

    let again = orchestrator.warmup(100, true, false);
    assert_eq!(again.compiled, 0);
    assert_eq!(orchestrator.wrapper_compile_count(), 1);
}

#[test]
fn test_warmup_reports_broken_native_script() {
    let config = ConfigBuilder::new()
        .script(ScriptDefinition::new("broken", "rhai", "let = = ;"))
        .build()
        .unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();

    let report = orchestrator.warmup(10, true, false);
    assert_eq!(report.compiled, 0);
    assert_eq!(report.failed, 1);
    assert!(orchestrator
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::Warmup && d.message.contains("broken")));
}

#[test]
fn test_warmup_records_failures() {
    let config = ConfigBuilder::new()
        .script(ScriptDefinition::new("broken", "lua", "local = = 1"))
        .script(
            ScriptDefinition::new("typed", "lua", "return n + 1")
                .with_argument(Argument::new("n", "int").required()),
        )
        .build()
        .unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();

    let report = orchestrator.warmup(10, true, false);
    assert_eq!(report.failed, 1);
    assert_eq!(report.compiled, 1);
    assert!(orchestrator
        .diagnostics()
        .iter()
        .any(|d| d.kind == DiagnosticKind::Warmup));

    assert_eq!(orchestrator.call_script(None, "typed", vec![json!("41")]).unwrap(), json!(42));
}

#[test]
fn test_initialize_from_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = courier_config::load(file.path()).unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();
    assert_eq!(orchestrator.call_script(Some("a"), "greet", vec![]).unwrap(), json!("hi a"));
}

#[test]
fn test_native_statement_scripts_return_null() {
    let config = ConfigBuilder::new()
        .script(
            ScriptDefinition::new("trailing", "rhai", "let x = 1;\nx + n")
                .with_argument(Argument::new("n", "int")),
        )
        .script(ScriptDefinition::new("statement", "rhai", "let y = 5;"))
        .script(
            ScriptDefinition::new("explicit", "rhai", "let x = 1;\nreturn x + n;")
                .with_argument(Argument::new("n", "int")),
        )
        .build()
        .unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();

    assert_eq!(orchestrator.call_script(None, "trailing", vec![json!(2)]).unwrap(), HostValue::Null);
    assert_eq!(orchestrator.call_script(None, "statement", vec![]).unwrap(), HostValue::Null);
    assert_eq!(orchestrator.call_script(None, "explicit", vec![json!(2)]).unwrap(), json!(3));
}

#[test]
fn test_unlinked_config_resolves_parent_and_requests() {
    let mut base = WorkspaceDefinition::new("b");
    base.requests.insert("login".into(), RequestDefinition::default());
    base.scripts.insert(
        "hello".into(),
        ScriptDefinition {
            name: String::new(),
            ..ScriptDefinition::new("", "lua", "'hello from ' .. workspace.name")
        },
    );
    let config = ScriptingConfig {
        workspaces: vec![WorkspaceDefinition::new("a").extending("b"), base],
        ..ScriptingConfig::default()
    };
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.initialize().unwrap();
    orchestrator.register_request_executor(|workspace, request, _| {
        Ok(json!({ "workspace": workspace, "request": request }))
    });

    assert_eq!(orchestrator.evaluate_dynamic("workspaces.a.parent.name").unwrap(), json!("b"));
    assert_eq!(
        orchestrator.evaluate_dynamic("workspaces.a.login.execute().request").unwrap(),
        json!("login")
    );
    assert_eq!(
        orchestrator.call_script(Some("a"), "hello", vec![]).unwrap(),
        json!("hello from b")
    );
}

#[test]
fn test_registered_enum_reaches_both_engines() {
    let config = ConfigBuilder::new()
        .script(
            ScriptDefinition::new("paint", "rhai", "c.name + \"=\" + c.value")
                .with_argument(Argument::new("c", "Color")),
        )
        .script(
            ScriptDefinition::new("label", "lua", "return c")
                .with_argument(Argument::new("c", "Color")),
        )
        .build()
        .unwrap();
    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default());
    orchestrator.register_enum("Color", [("Red", 1), ("Green", 2)]);
    orchestrator.initialize().unwrap();

    assert_eq!(orchestrator.call_script(None, "paint", vec![json!("green")]).unwrap(), json!("Green=2"));
    assert_eq!(orchestrator.call_script(None, "label", vec![json!(1)]).unwrap(), json!("Red"));

    orchestrator.register_enum("Color", [("Blue", 3)]);
    assert_eq!(orchestrator.call_script(None, "paint", vec![json!("3")]).unwrap(), json!("Blue=3"));

    orchestrator.reset_for_reload();
    orchestrator.initialize().unwrap();
    assert_eq!(orchestrator.call_script(None, "label", vec![json!("blue")]).unwrap(), json!("Blue"));
    assert!(matches!(
        orchestrator.call_script(None, "paint", vec![json!("red")]),
        Err(ScriptError::Conversion { .. })
    ));
}

#[test]
fn test_init_body_may_reenter_activation() {
    let mut workspace = WorkspaceDefinition::new("a");
    workspace.requests.insert("ping".into(), RequestDefinition::default());
    workspace.init = ScriptBlock::single(
        "lua",
        "init_runs = (init_runs or 0) + 1\npinged = workspaces.a.ping.execute().ok",
    );
    let config = ConfigBuilder::new().workspace(workspace).active("a").build().unwrap();

    let orchestrator = Arc::new(ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::default()));
    let handle: Weak<ScriptOrchestrator> = Arc::downgrade(&orchestrator);
    orchestrator.register_request_executor(move |workspace, _, _| {
        let orchestrator = handle.upgrade().ok_or(ScriptError::NotInitialized)?;
        let activated = orchestrator.activate_workspace(workspace);
        Ok(json!({ "ok": activated.is_ok() }))
    });
    orchestrator.initialize().unwrap();

    assert_eq!(orchestrator.evaluate_dynamic("pinged").unwrap(), json!(true));
    assert_eq!(orchestrator.evaluate_dynamic("init_runs").unwrap(), json!(1));
}
