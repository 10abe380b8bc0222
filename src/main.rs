use std::{ffi::OsString, process, sync::Arc};

use prerender::{
    application::{
        error::AppError,
        orchestrator::{BatchOptions, BatchOutcome, run_batch},
        routes::PayloadDirectory,
        worker::{
            StandardWorkerFactory, WORKER_SUBCOMMAND, WorkerEnv, WorkerError, WorkerSpec,
            serve_stdio,
        },
    },
    config::{self, BuildArgs, CliArgs, Command, OutputTarget, Settings},
    domain::Route,
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(causes = ?report.messages, "application error: {error}");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(causes = ?report.messages, "application error: {error}");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command.clone() {
        Some(Command::Worker) => run_worker().await,
        Some(Command::Build(args)) => run_build(&cli_args, settings, *args).await,
        None => run_build(&cli_args, settings, BuildArgs::default()).await,
    }
}

async fn run_worker() -> Result<(), AppError> {
    let env = WorkerEnv::from_env().map_err(WorkerError::from)?;
    serve_stdio(&StandardWorkerFactory, env).await?;

    // Blocking stdin reads cannot be cancelled, so do not wait for runtime shutdown.
    process::exit(0);
}

async fn run_build(cli: &CliArgs, settings: Settings, args: BuildArgs) -> Result<(), AppError> {
    let handler = PayloadDirectory::new(&settings.build.payload_dir, settings.build.chunk_size);

    let routes = if args.routes.is_empty() {
        handler.discover().map_err(InfraError::from)?
    } else {
        args.routes
            .iter()
            .map(Route::parse)
            .collect::<Result<Vec<_>, _>>()?
    };
    if routes.is_empty() {
        warn!(
            payload_dir = %settings.build.payload_dir.display(),
            "No routes to render"
        );
        return Ok(());
    }

    let options = BatchOptions {
        out_dir: match &settings.build.output {
            OutputTarget::Directory(dir) => Some(dir.clone()),
            OutputTarget::Inline => None,
        },
        base_path: settings.build.base_path.clone(),
        module_root: settings.worker.module_root.clone(),
        max_concurrency: settings.build.max_concurrency,
        write_payload: settings.build.write_payload,
    };

    let spec = worker_spec(cli, &settings)?;
    let outcome = run_batch(spec, routes, &handler, &options).await?;
    report_outcome(&outcome, &settings.build.output)?;

    if outcome.is_total_failure() {
        return Err(AppError::BuildFailed {
            failed: outcome.failed.len(),
        });
    }
    Ok(())
}

fn worker_spec(cli: &CliArgs, settings: &Settings) -> Result<WorkerSpec, AppError> {
    let worker = &settings.worker;
    let env = WorkerEnv::for_host(worker.mode, worker.host_condition)
        .with_module_root(worker.module_root.clone())
        .with_message_budget(worker.message_budget);

    let mut spec = if worker.in_process {
        WorkerSpec::in_process(Arc::new(StandardWorkerFactory), env)
    } else {
        match &worker.program {
            Some(program) => {
                WorkerSpec::process(program, vec![OsString::from(WORKER_SUBCOMMAND)], env)
            }
            None => WorkerSpec::current_exe(env).map_err(InfraError::from)?,
        }
    };

    spec = spec
        .with_handshake_timeout(worker.handshake_timeout)
        .with_shutdown_grace(worker.shutdown_grace);
    for (key, value) in telemetry::worker_env(&settings.logging) {
        spec = spec.with_env(key, value);
    }
    if let Some(path) = &cli.config_file {
        spec = spec.with_env("PRERENDER_CONFIG_FILE", path.display().to_string());
    }
    Ok(spec)
}

fn report_outcome(outcome: &BatchOutcome, output: &OutputTarget) -> Result<(), AppError> {
    info!(
        batch_id = %outcome.batch_id,
        completed = outcome.completed.len(),
        failed = outcome.failed.len(),
        skipped = outcome.skipped.len(),
        "Build finished"
    );

    if let OutputTarget::Inline = output {
        let summary = serde_json::to_string_pretty(&outcome.summary())
            .map_err(|err| InfraError::output(err.to_string()))?;
        println!("{summary}");
    }
    Ok(())
}
