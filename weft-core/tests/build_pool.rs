//! Build pool integration tests, driven by stand-in compiler scripts.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use weft_core::build::{BuildConfig, BuildPool};
use weft_core::{BuildPriority, BuildStatus, Component, Parameter, Project, WeftError};

const BUTTON: &str =
    "package components\n\ntempl Button(text string) { <button>{text}</button> }\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    project: Arc<Project>,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let project = Project::new(&root, root.join(".weft-cache")).unwrap();
    Fixture {
        _tmp: tmp,
        root,
        project,
    }
}

fn component(root: &Path, rel: &str, name: &str) -> Arc<Component> {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, BUTTON).unwrap();
    Arc::new(Component {
        name: name.to_string(),
        package: "components".to_string(),
        file_path: PathBuf::from(rel),
        parameters: vec![Parameter::required("text", "string")],
        imports: Vec::new(),
        dependencies: Default::default(),
        last_mod: chrono::Utc::now(),
        hash: "fp".to_string(),
        metadata: BTreeMap::new(),
    })
}

fn config(compiler: PathBuf) -> BuildConfig {
    BuildConfig {
        compiler_path: compiler,
        worker_count: 2,
        queue_capacity: 4,
        submit_timeout: Duration::from_secs(1),
        compile_timeout: Duration::from_secs(10),
        retry_initial: Duration::from_millis(10),
        retry_cap: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_compile_then_artifact_cache_hit() {
    let fx = fixture();
    let compiler = write_script(&fx.root, "cc.sh", "#!/bin/sh\ncat \"$1\"\n");
    let pool = BuildPool::new(Arc::clone(&fx.project), config(compiler))
        .await
        .unwrap();
    let button = component(&fx.root, "button.templ", "Button");

    let first = pool
        .submit(Arc::clone(&button), BuildPriority::User)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(first.status, BuildStatus::Succeeded);
    assert!(first.success);
    assert!(!first.cached);
    assert_eq!(first.output_bytes, BUTTON.len() as u64);

    let second = pool
        .submit(button, BuildPriority::User)
        .await
        .unwrap()
        .await
        .unwrap();
    assert!(second.success);
    assert!(second.cached, "identical source must hit the artifact cache");

    let metrics = pool.metrics();
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.cache_hits, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn compile_errors_are_reported_with_diagnostics_not_retried() {
    let fx = fixture();
    let compiler = write_script(
        &fx.root,
        "cc.sh",
        "#!/bin/sh\necho \"button.templ:3:7: error: unexpected token '}'\" >&2\nexit 1\n",
    );
    let pool = BuildPool::new(Arc::clone(&fx.project), config(compiler))
        .await
        .unwrap();
    let button = component(&fx.root, "button.templ", "Button");

    let result = pool
        .submit(button, BuildPriority::Watcher)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::FailedCompile);
    assert!(!result.success);
    assert_eq!(result.parsed_errors.len(), 1);
    let diag = &result.parsed_errors[0];
    assert_eq!(diag.file, "button.templ");
    assert_eq!(diag.line, 3);
    assert_eq!(diag.column, 7);
    assert!(diag.message.contains("unexpected token"));
    assert_eq!(pool.metrics().compile_failures, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn missing_compiler_is_retried_then_surfaced_as_transport_failure() {
    let fx = fixture();
    let pool = BuildPool::new(
        Arc::clone(&fx.project),
        config(fx.root.join("no-such-compiler")),
    )
    .await
    .unwrap();
    let button = component(&fx.root, "button.templ", "Button");

    let result = pool
        .submit(button, BuildPriority::Background)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::FailedTransport);
    assert!(result.error.as_deref().unwrap_or("").contains("launch"));
    assert_eq!(pool.metrics().transport_failures, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_yields_backpressure_and_accepted_tasks_one_result_each() {
    let fx = fixture();
    let compiler = write_script(&fx.root, "cc.sh", "#!/bin/sh\nsleep 0.2\ncat \"$1\"\n");
    let mut cfg = config(compiler);
    cfg.submit_timeout = Duration::from_millis(50);
    let pool = BuildPool::new(Arc::clone(&fx.project), cfg).await.unwrap();

    let mut accepted = Vec::new();
    let mut rejected = 0usize;
    for i in 0..30 {
        let c = component(&fx.root, &format!("c{i}.templ"), &format!("C{i}"));
        match pool.submit(c, BuildPriority::Watcher).await {
            Ok(receiver) => accepted.push(receiver),
            Err(WeftError::Backpressure(_)) => rejected += 1,
            Err(other) => panic!("unexpected submit error: {other}"),
        }
    }
    assert!(rejected > 0, "expected some submissions to be refused");
    assert!(!accepted.is_empty());

    let mut results = 0usize;
    for receiver in accepted {
        let result = receiver.await.expect("every accepted task terminates");
        assert_ne!(result.status, BuildStatus::Cancelled);
        results += 1;
    }
    assert_eq!(results as u64, pool.metrics().completed);
    pool.shutdown().await;
}

#[tokio::test]
async fn user_priority_overtakes_background_within_the_queue() {
    let fx = fixture();
    let compiler = write_script(&fx.root, "cc.sh", "#!/bin/sh\nsleep 0.2\ncat \"$1\"\n");
    let mut cfg = config(compiler);
    cfg.worker_count = 1;
    cfg.queue_capacity = 8;
    let pool = BuildPool::new(Arc::clone(&fx.project), cfg).await.unwrap();
    let mut results = pool.subscribe_results();

    let a = component(&fx.root, "a.templ", "A");
    let b = component(&fx.root, "b.templ", "B");
    let c = component(&fx.root, "c.templ", "C");
    let ra = pool.submit(a, BuildPriority::Background).await.unwrap();
    let rb = pool.submit(b, BuildPriority::Background).await.unwrap();
    let rc = pool.submit(c, BuildPriority::User).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(results.recv().await.unwrap().component);
    }
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(
        pos("C") < pos("B"),
        "user-triggered build must overtake queued background work: {order:?}"
    );

    for receiver in [ra, rb, rc] {
        receiver.await.unwrap();
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn command_rewrites_apply_but_cannot_swap_the_compiler() {
    use weft_core::build::BuildCommand;

    let fx = fixture();
    let args_file = fx.root.join("args.txt");
    let compiler = write_script(
        &fx.root,
        "cc.sh",
        &format!("#!/bin/sh\necho \"$@\" > \"{}\"\nexit 0\n", args_file.display()),
    );
    let pool = BuildPool::new(Arc::clone(&fx.project), config(compiler))
        .await
        .unwrap();
    pool.set_command_rewriter(Arc::new(|mut command: BuildCommand| {
        command.args.push("--minify".to_string());
        command.program = PathBuf::from("/bin/true"); // must be ignored
        command
    }));

    let result = pool
        .submit(component(&fx.root, "button.templ", "Button"), BuildPriority::User)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Succeeded);

    // The rewrite changed the program, so the whole rewrite is discarded
    // and the original argument list reaches the allow-listed compiler.
    let recorded = std::fs::read_to_string(&args_file).unwrap();
    assert!(!recorded.contains("--minify"));
    assert!(recorded.contains("button.templ"));
    pool.shutdown().await;
}

#[tokio::test]
async fn argument_only_rewrites_reach_the_compiler() {
    use weft_core::build::BuildCommand;

    let fx = fixture();
    let args_file = fx.root.join("args.txt");
    let compiler = write_script(
        &fx.root,
        "cc.sh",
        &format!("#!/bin/sh\necho \"$@\" > \"{}\"\nexit 0\n", args_file.display()),
    );
    let pool = BuildPool::new(Arc::clone(&fx.project), config(compiler))
        .await
        .unwrap();
    pool.set_command_rewriter(Arc::new(|mut command: BuildCommand| {
        command.args.push("--minify".to_string());
        command
    }));

    let result = pool
        .submit(component(&fx.root, "button.templ", "Button"), BuildPriority::User)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Succeeded);

    let recorded = std::fs::read_to_string(&args_file).unwrap();
    assert!(recorded.contains("--minify"));
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_queued_tasks_and_drains_in_flight() {
    let fx = fixture();
    let compiler = write_script(&fx.root, "cc.sh", "#!/bin/sh\nsleep 0.5\ncat \"$1\"\n");
    let mut cfg = config(compiler);
    cfg.worker_count = 1;
    let pool = BuildPool::new(Arc::clone(&fx.project), cfg).await.unwrap();

    let first = pool
        .submit(component(&fx.root, "a.templ", "A"), BuildPriority::User)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = pool
        .submit(component(&fx.root, "b.templ", "B"), BuildPriority::User)
        .await
        .unwrap();

    pool.shutdown().await;

    let in_flight = first.await.unwrap();
    assert_eq!(in_flight.status, BuildStatus::Succeeded);
    let cancelled = queued.await.unwrap();
    assert_eq!(cancelled.status, BuildStatus::Cancelled);

    let err = pool
        .submit(component(&fx.root, "c.templ", "C"), BuildPriority::User)
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Cancelled(_)));
}
