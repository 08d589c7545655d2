use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use surge_core::source::SourceKind;
use surge_core::{Engine, Options};
use surge_metrics::Registry;

use crate::api;
use crate::cli::{InspectArgs, RunArgs};
use crate::exit_codes::ExitCode;
use crate::input;
use crate::progress;
use crate::summary;

/// Fallbacks applied after the merge to fields no layer claimed.
const DEFAULT_VUS: i64 = 10;
const DEFAULT_DURATION: Duration = Duration::from_secs(10);

pub async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let src = input::resolve_source(&args.target, args.source_type)?;
    let registry = Arc::new(Registry::default());
    let runner = input::make_runner(&src, registry.clone()).await?;

    // Merge precedence, lowest to highest: runner-declared defaults, config
    // files in order, CLI flags. Live API patches come later, at runtime.
    let mut opts = runner.options();
    apply_config_files(&mut opts, &args.config)?;
    opts.apply(&args.options());

    if opts.vus.value.is_none() {
        opts.vus.value = Some(DEFAULT_VUS);
    }
    if opts.duration.value.is_none() {
        opts.duration.value = Some(DEFAULT_DURATION);
    }
    opts.normalize().context("invalid options")?;
    opts.set_all_valid();

    runner
        .apply_options(&opts)
        .context("failed to apply options to the runner")?;

    let mut engine = Engine::new(runner, registry.clone(), &opts)?;
    let output = match &args.out {
        Some(out) => {
            engine.set_collector(input::make_collector(out, registry.clone())?);
            out.clone()
        }
        None => "-".to_string(),
    };
    let engine = Arc::new(engine);

    // The API server failing to bind is logged but does not stop the test.
    let api = match api::ApiServer::start(args.address, engine.clone()).await {
        Ok(api) => Some(api),
        Err(err) => {
            tracing::error!(error = %err, "couldn't start the control API server");
            None
        }
    };

    summary::print_banner(&src, &opts, &output, api.as_ref().map(|a| a.url()).as_deref());

    let signals = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupt received, shutting down");
                engine.cancel();
            }
        })
    };

    let progress = progress::Progress::start(engine.clone());
    let run_result = engine.clone().run().await;
    progress.finish();

    run_result.context("engine error")?;

    if opts.linger.value_or(false) && !signals.is_finished() {
        eprintln!("lingering, press ctrl-c to exit");
        let _ = signals.await;
    } else {
        signals.abort();
    }

    if let Some(api) = api {
        api.shutdown().await;
    }

    summary::print_report(&engine, &opts);

    Ok(if engine.tainted() {
        ExitCode::Tainted
    } else {
        ExitCode::Success
    })
}

pub async fn inspect(args: InspectArgs) -> anyhow::Result<()> {
    let src = input::resolve_source(&args.target, args.source_type)?;

    let mut opts = match src.kind {
        SourceKind::Script => {
            let registry = Arc::new(Registry::default());
            input::make_runner(&src, registry).await?.options()
        }
        SourceKind::Url => Options::default(),
    };
    apply_config_files(&mut opts, &args.config)?;

    let rendered = serde_yaml::to_string(&opts).context("failed to render options")?;
    print!("{rendered}");
    Ok(())
}

fn apply_config_files(opts: &mut Options, paths: &[PathBuf]) -> anyhow::Result<()> {
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let layer: Options = serde_yaml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        opts.apply(&layer);
    }
    Ok(())
}
