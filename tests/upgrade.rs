//! Live upgrade of the demo binary: SIGUSR2 hands the listener to a fresh
//! process without failing a single request.

#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use servicekit::health::HealthReport;
use tokio::process::Command;

mod common;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn signal(pid: u32, signal: libc::c_int) {
    // SAFETY: plain kill(2) on a pid we started or were told about.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "kill({pid}, {signal}) failed");
}

async fn health(client: &reqwest::Client, url: &str) -> reqwest::Result<HealthReport> {
    client.get(url).send().await?.error_for_status()?.json().await
}

#[tokio::test]
async fn sigusr2_hands_over_without_dropping_requests() {
    let address = format!("127.0.0.1:{}", free_port());
    let url = format!("http://{address}/health");
    let client = common::http1_client();

    // 1. Start the first generation.
    let mut first = Command::new(env!("CARGO_BIN_EXE_servicekit"))
        .args(["--address", &address])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let first_pid = first.id().unwrap();

    let c = &client;
    let u = url.as_str();
    let up = common::wait_until(Duration::from_secs(10), || async move { health(c, u).await.is_ok() }).await;
    assert!(up, "first generation never became healthy");
    assert_eq!(health(&client, &url).await.unwrap().pid, first_pid);

    // Signal handlers are installed right after the listener starts serving.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 2. Open a long-lived stream on the first generation, then upgrade,
    //    polling every 10ms; every request must succeed.
    let stream_url = format!("http://{address}/stream?count=20");
    let long_lived = tokio::spawn(async move {
        common::http1_client().get(stream_url).send().await?.text().await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    signal(first_pid, libc::SIGUSR2);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let second_pid = loop {
        let report = health(&client, &url).await.expect("request failed during upgrade");
        if report.pid != first_pid {
            break report.pid;
        }
        assert!(tokio::time::Instant::now() < deadline, "upgrade never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // 3. The stream finishes on the old generation, which then exits
    //    cleanly; the new one serves.
    let body = long_lived.await.unwrap().expect("stream broken by upgrade");
    let chunks: Vec<&str> = body.lines().collect();
    assert_eq!(chunks.len(), 20);
    assert!(chunks.iter().all(|line| line.ends_with(&format!("pid {first_pid}"))));

    let status = tokio::time::timeout(Duration::from_secs(15), first.wait())
        .await
        .expect("old generation did not exit")
        .unwrap();
    assert!(status.success(), "old generation exited with {status}");

    for _ in 0..20 {
        let report = health(&client, &url).await.unwrap();
        assert_eq!(report.pid, second_pid);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // 4. SIGTERM stops the new generation and closes the port.
    signal(second_pid, libc::SIGTERM);
    let a = address.as_str();
    let stopped = common::wait_until(Duration::from_secs(10), || async move {
        tokio::net::TcpStream::connect(a).await.is_err()
    })
    .await;
    assert!(stopped, "new generation kept serving after SIGTERM");
}
