use std::{path::Path, process};

use mathsnap::{
    application::{
        error::AppError,
        render::{CoordinatorConfig, RenderResult, configure_shared_manager, shared_manager},
    },
    config::{self, RenderArgs},
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;
    configure_shared_manager(CoordinatorConfig::from(&settings.render))
        .map_err(|err| AppError::unexpected(err.to_string()))?;

    match cli_args.command {
        config::Command::Render(args) => run_render(args).await,
    }
}

async fn run_render(args: RenderArgs) -> Result<(), AppError> {
    let RenderArgs {
        out_dir, formulas, ..
    } = args;

    tokio::fs::create_dir_all(&out_dir)
        .await
        .map_err(InfraError::from)?;

    let coordinator = shared_manager();
    let results = coordinator.render(formulas.clone()).await;

    let mut failed = 0usize;
    for (index, (formula, result)) in formulas.iter().zip(results).enumerate() {
        if let RenderResult::Failed(err) = &result {
            failed += 1;
            warn!(index, formula = %formula, error = %err, "Formula rendered as placeholder");
        }
        let image = result.into_image_or_placeholder();
        let path = out_dir.join(format!(
            "formula-{index}.{}",
            image.media_type().extension()
        ));
        write_image(&path, image.data()).await?;
        info!(
            index,
            path = %path.display(),
            bytes = image.len(),
            "Formula written"
        );
    }

    if failed > 0 {
        return Err(AppError::render(format!(
            "{failed} of {} formulas could not be rendered",
            formulas.len()
        )));
    }

    Ok(())
}

async fn write_image(path: &Path, data: &[u8]) -> Result<(), AppError> {
    tokio::fs::write(path, data)
        .await
        .map_err(InfraError::from)?;
    Ok(())
}
