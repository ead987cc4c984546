use super::*;

use std::time::Instant;

use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn spawn_piped_tags_stdout_lines() {
    let mut cmd = Command::new("echo");
    cmd.arg("hello");

    let mut process = spawn_piped(cmd).await.expect("spawn echo");
    let line = process.lines.recv().await.expect("one line");
    assert_eq!(
        line,
        OutputLine {
            source: StreamSource::Stdout,
            line: "hello".into(),
        }
    );

    // EOF on both streams closes the channel.
    assert!(process.lines.recv().await.is_none());
    let status = process.child.wait().await.expect("wait echo");
    assert!(status.success());
}

#[tokio::test]
async fn spawn_piped_tags_stderr_lines() {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("echo oops 1>&2");

    let mut process = spawn_piped(cmd).await.expect("spawn sh");
    let line = process.lines.recv().await.expect("one line");
    assert_eq!(line.source, StreamSource::Stderr);
    assert_eq!(line.line, "oops");
    let _ = process.child.wait().await;
}

#[tokio::test]
async fn stdin_reaches_the_worker() {
    let cmd = Command::new("cat");
    let mut process = spawn_piped(cmd).await.expect("spawn cat");

    process.stdin.write_all(b"ping\n").await.expect("write");
    process.stdin.flush().await.expect("flush");

    let line = process.lines.recv().await.expect("echoed line");
    assert_eq!(line.source, StreamSource::Stdout);
    assert_eq!(line.line, "ping");

    // Closing stdin lets cat exit.
    drop(process.stdin);
    assert!(process.lines.recv().await.is_none());
    let status = process.child.wait().await.expect("wait cat");
    assert!(status.success());
}

#[tokio::test]
async fn wait_with_grace_reaps_a_prompt_exit() {
    let cmd = Command::new("true");
    let mut process = spawn_piped(cmd).await.expect("spawn true");
    let status = wait_with_grace(&mut process.child, Duration::from_secs(5)).await;
    assert!(status.is_some_and(|status| status.success()));
}

#[tokio::test]
async fn wait_with_grace_kills_a_lingering_worker() {
    let mut cmd = Command::new("sleep");
    cmd.arg("30");
    let mut process = spawn_piped(cmd).await.expect("spawn sleep");

    let started = Instant::now();
    let status = wait_with_grace(&mut process.child, Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    // Killed by signal: no exit code.
    assert!(status.is_none_or(|status| !status.success()));
}

#[tokio::test]
async fn manager_spawns_in_the_configured_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = CommandProcessManager::new("pwd").current_dir(dir.path());

    let mut process = manager.spawn().await.expect("spawn pwd");
    let line = process.lines.recv().await.expect("one line");
    assert_eq!(line.source, StreamSource::Stdout);
    // Canonicalize both sides; the temp dir may sit behind a symlink.
    assert_eq!(
        std::fs::canonicalize(&line.line).ok(),
        std::fs::canonicalize(dir.path()).ok()
    );
    let _ = process.child.wait().await;
}

#[tokio::test]
async fn pid_is_reported_while_running() {
    let cmd = Command::new("cat");
    let mut process = spawn_piped(cmd).await.expect("spawn cat");
    assert!(process.pid().is_some());
    drop(process.stdin);
    let _ = process.child.wait().await;
}
