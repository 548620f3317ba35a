use anyhow::{bail, Context};
use eew_common::health::HealthRegistry;
use eew_common::metrics::{serve, setup_service_router};
use eew_common::signals::wait_for_shutdown_signal;
use eew_common::stream::kinesis::KinesisLog;
use eew_replay::archive::S3Archive;
use eew_replay::config::Config;
use eew_replay::replayer::Replayer;
use eew_replay::source::ReplaySource;
use eew_replay::writer::BatchedLogWriter;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eew_common::setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid configuration")?;
    if config.replay_end.0 <= config.replay_start.0 {
        bail!(
            "REPLAY_END {} is not after REPLAY_START {}",
            config.replay_end.0,
            config.replay_start.0
        );
    }

    let liveness = HealthRegistry::new("liveness");
    let replay_liveness = liveness.register("replay", config.liveness_deadline_ms.0);

    let router = setup_service_router("eew replay", liveness)
        .context("failed to install metrics recorder")?;
    let bind = config.server.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("metrics server failed: {e}");
        }
    });

    let aws = config.aws.load().await;
    let source = ReplaySource::new(
        S3Archive::new(aws_sdk_s3::Client::new(&aws)),
        config.archive_bucket.clone(),
        config.archive_country.clone(),
    );
    let writer = BatchedLogWriter::new(
        KinesisLog::new(aws_sdk_kinesis::Client::new(&aws)),
        config.input_stream.as_str(),
        config.log_batch_size,
        config.emission_interval(),
    )
    .with_liveness(replay_liveness.clone());

    let replayer = Replayer::new(
        source,
        writer,
        config.device.as_str(),
        config.replay_start.0,
        config.replay_end.0,
        config.replay_window_secs,
    )
    .with_liveness(replay_liveness);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let summary = replayer
        .run(&shutdown)
        .await
        .with_context(|| format!("replay into {} failed", config.input_stream.as_str()))?;

    info!(
        windows = summary.windows,
        failed_windows = summary.failed_windows,
        emitted = summary.sent.emitted,
        batches = summary.sent.batches,
        failed_records = summary.sent.failed_records,
        "replay finished"
    );
    Ok(())
}
