use std::net::SocketAddr;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context as _;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Minimal HTTP target for URL-mode runs.
async fn start_test_server() -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    use axum::{Router, routing::get};

    let app = Router::new().route("/", get(|| async { "hello" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind test server")?;
    let addr = listener.local_addr().context("test server addr")?;
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, task))
}

async fn run_surge(args: Vec<String>) -> anyhow::Result<std::process::Output> {
    let exe = env!("CARGO_BIN_EXE_surge");
    tokio::task::spawn_blocking(move || {
        Command::new(exe)
            .args(&args)
            .output()
            .context("run surge binary")
    })
    .await
    .context("spawn_blocking join")?
}

#[tokio::test]
async fn url_mode_completes_with_exit_zero() -> anyhow::Result<()> {
    let (addr, server) = start_test_server().await?;

    let out = run_surge(vec![
        "run".into(),
        format!("http://{addr}/"),
        "--vus".into(),
        "2".into(),
        "--duration".into(),
        "1s".into(),
        "--address".into(),
        "127.0.0.1:0".into(),
    ])
    .await?;
    server.abort();

    anyhow::ensure!(
        status_code(out.status) == 0,
        "expected exit code 0, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    anyhow::ensure!(
        stdout.contains("http_reqs"),
        "summary is missing http_reqs:\n{stdout}"
    );
    Ok(())
}

#[tokio::test]
async fn inline_script_check_passes() -> anyhow::Result<()> {
    let out = run_surge(vec![
        "run".into(),
        "check('ok', 1 == 1)".into(),
        "--type".into(),
        "script".into(),
        "--vus".into(),
        "1".into(),
        "--duration".into(),
        "300ms".into(),
        "--address".into(),
        "127.0.0.1:0".into(),
    ])
    .await?;

    anyhow::ensure!(
        status_code(out.status) == 0,
        "expected exit code 0, got {}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    anyhow::ensure!(stdout.contains("ok"), "summary is missing the check:\n{stdout}");
    Ok(())
}

#[tokio::test]
async fn failed_threshold_taints_the_run() -> anyhow::Result<()> {
    let script = r#"
options = {
    thresholds = { latency = "p(95)<100" },
}
function Default()
    trend("latency", 500)
end
"#;

    let out = run_surge(vec![
        "run".into(),
        script.into(),
        "--type".into(),
        "script".into(),
        "--vus".into(),
        "1".into(),
        "--duration".into(),
        "500ms".into(),
        "--address".into(),
        "127.0.0.1:0".into(),
    ])
    .await?;

    anyhow::ensure!(
        status_code(out.status) == 99,
        "expected exit code 99, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

#[tokio::test]
async fn setup_errors_exit_one() -> anyhow::Result<()> {
    // Unknown collector kind.
    let out = run_surge(vec![
        "run".into(),
        "check('ok', true)".into(),
        "--type".into(),
        "script".into(),
        "--out".into(),
        "bogus=somewhere".into(),
    ])
    .await?;
    anyhow::ensure!(status_code(out.status) == 1, "unknown collector should exit 1");

    // Unparseable duration is a usage error.
    let out = run_surge(vec![
        "run".into(),
        "check('ok', true)".into(),
        "--duration".into(),
        "10x".into(),
    ])
    .await?;
    anyhow::ensure!(status_code(out.status) == 1, "bad duration should exit 1");

    // URL type with a missing file.
    let out = run_surge(vec![
        "run".into(),
        "./definitely-missing-target".into(),
        "--type".into(),
        "url".into(),
    ])
    .await?;
    anyhow::ensure!(status_code(out.status) == 1, "missing url file should exit 1");

    Ok(())
}

#[tokio::test]
async fn control_api_pauses_and_stops_an_unbounded_run() -> anyhow::Result<()> {
    let api_addr = "127.0.0.1:16765";
    let exe = env!("CARGO_BIN_EXE_surge");
    let mut child = Command::new(exe)
        .args([
            "run",
            "sleep(0.02)",
            "--type",
            "script",
            "--vus",
            "1",
            "--max",
            "4",
            "--duration",
            "0",
            "--address",
            api_addr,
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn surge")?;

    let client = surge_core::HttpClient::default();
    let status_url = format!("http://{api_addr}/v1/status");

    // Wait for the engine to come up.
    let mut running = false;
    for _ in 0..50 {
        if let Ok(res) = client.get(&status_url).await
            && res.status == 200
            && let Ok(body) = serde_json::from_slice::<serde_json::Value>(&res.body)
            && body["running"] == true
        {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::ensure!(running, "engine never reported running");

    let patch = |body: &'static str| {
        let client = client.clone();
        let url = status_url.clone();
        async move {
            let mut req = surge_core::http::HttpRequest::post(&url, body.into());
            req.method = http::Method::PATCH;
            req.headers
                .push(("content-type".to_string(), "application/json".to_string()));
            client.request(req).await
        }
    };

    // Pause and verify the clock freezes.
    let res = patch(r#"{"paused": true}"#).await.context("pause patch")?;
    anyhow::ensure!(res.status == 200, "pause patch rejected: {}", res.status);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let first = serde_json::from_slice::<serde_json::Value>(&client.get(&status_url).await?.body)?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = serde_json::from_slice::<serde_json::Value>(&client.get(&status_url).await?.body)?;
    anyhow::ensure!(
        first["at-time-ms"] == second["at-time-ms"],
        "clock advanced while paused: {} -> {}",
        first["at-time-ms"],
        second["at-time-ms"]
    );
    anyhow::ensure!(second["paused"] == true, "status does not report paused");

    // Scaling past the pool is a validation error.
    let res = patch(r#"{"vus": 99}"#).await.context("overscale patch")?;
    anyhow::ensure!(res.status == 400, "overscale patch should 400");

    // Resume, then stop via the API.
    let res = patch(r#"{"paused": false}"#).await.context("resume patch")?;
    anyhow::ensure!(res.status == 200, "resume patch rejected");

    let res = patch(r#"{"running": false}"#).await.context("stop patch")?;
    anyhow::ensure!(res.status == 200, "stop patch rejected");

    let mut exit = None;
    for _ in 0..50 {
        if let Some(status) = child.try_wait().context("try_wait")? {
            exit = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let Some(exit) = exit else {
        let _ = child.kill();
        anyhow::bail!("surge did not exit after the stop patch");
    };
    anyhow::ensure!(
        status_code(exit) == 0,
        "expected exit code 0, got {}",
        status_code(exit)
    );
    Ok(())
}
