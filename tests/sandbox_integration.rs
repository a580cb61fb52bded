//! End-to-end tests against a real Docker daemon. Run with
//! `cargo test -- --ignored` on a machine where Docker is available; the
//! sandbox image is built on first use.

use runlet::config::types::SandboxPolicy;
use runlet::events;
use runlet::sandbox::{Engine, TIMEOUT_EXIT_CODE};

fn policy(timeout_seconds: u64) -> SandboxPolicy {
    SandboxPolicy {
        timeout_seconds,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore]
async fn python_error_surfaces_in_output() {
    let engine = Engine::new(policy(5));
    let (sink, _rx) = events::channel();

    let result = engine
        .execute(9001, "python", "print(1/0)", &sink)
        .await
        .unwrap();

    assert_ne!(result.exit_code, 0);
    assert!(result.output.contains("ZeroDivisionError"));
    assert!(result.artifacts.is_empty());

    engine.release(9001).await;
}

#[tokio::test]
#[ignore]
async fn sleeping_script_hits_the_timeout() {
    let engine = Engine::new(policy(2));
    let (sink, _rx) = events::channel();

    let result = engine
        .execute(9002, "bash", "sleep 100", &sink)
        .await
        .unwrap();

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.timed_out);
    // Duration is the wrapper's limit plus scheduling slack
    assert!(result.duration_secs >= 2.0 && result.duration_secs < 10.0);

    engine.release(9002).await;
}

#[tokio::test]
#[ignore]
async fn created_files_are_captured_as_artifacts() {
    let engine = Engine::new(policy(5));
    let (sink, _rx) = events::channel();

    let source = "with open('out.txt', 'w') as f:\n    f.write('hello artifacts')\n";
    let result = engine.execute(9003, "python", source, &sink).await.unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].filename, "out.txt");
    assert_eq!(result.artifacts[0].content, "hello artifacts");

    engine.release(9003).await;
}

#[tokio::test]
#[ignore]
async fn session_container_is_reused_across_runs() {
    let engine = Engine::new(policy(5));
    let (sink, _rx) = events::channel();

    let first = engine
        .execute(9004, "python", "print('a')", &sink)
        .await
        .unwrap();
    let second = engine
        .execute(9004, "python", "print('b')", &sink)
        .await
        .unwrap();

    assert_eq!(first.container_id, second.container_id);

    engine.release(9004).await;
    // Idempotent on a released session
    engine.release(9004).await;
}
