use anyhow::Result;
use clap::Parser;
use replaycrab::capture::PcapStreamSource;
use replaycrab::classifier::Classifier;
use replaycrab::config::{Cli, Config, OutputTarget};
use replaycrab::emitter::{FlowEmitter, JsonLinesEmitter};
use replaycrab::keylog::KeyMaterial;
use replaycrab::logging::{init_logging, pipeline_span};
use replaycrab::pipeline::{Pipeline, RunSummary};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

fn main() -> ExitCode {
    let config: Config = Cli::parse().into();

    let _guard = match init_logging(&config.log_target, config.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:?}");
            return ExitCode::FAILURE;
        }
    };

    // Reported once on stderr whatever the log target; returning lets the
    // guard flush a log file.
    match run(&config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<RunSummary> {
    let keys = match &config.keylog {
        Some(path) => KeyMaterial::from_file(path)?,
        None => KeyMaterial::empty(),
    };
    info!(entries = keys.len(), "Loaded TLS key material");

    let classifier = config.classifier(Arc::new(keys));
    let mut source = PcapStreamSource::new(config.capture.clone());
    let pipeline = Pipeline::new(config.mode, pipeline_span(&config.capture));

    match &config.output {
        OutputTarget::Stdout => convert(
            &pipeline,
            &mut source,
            &classifier,
            JsonLinesEmitter::stdout(),
        ),
        OutputTarget::File(path) => convert(
            &pipeline,
            &mut source,
            &classifier,
            JsonLinesEmitter::create(path)?,
        ),
    }
}

fn convert<E: FlowEmitter>(
    pipeline: &Pipeline,
    source: &mut PcapStreamSource,
    classifier: &Classifier,
    mut emitter: E,
) -> Result<RunSummary> {
    pipeline.run(source, classifier, &mut emitter)
}
