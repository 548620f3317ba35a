use std::time::Duration;

use anyhow::{bail, Context};
use eew_common::health::HealthRegistry;
use eew_common::metrics::{serve, setup_service_router};
use eew_common::signals::wait_for_shutdown_signal;
use eew_common::stream::kinesis::KinesisLog;
use eew_consumer::alert::AlertGate;
use eew_consumer::config::Config;
use eew_consumer::consumer::{ConsumerSettings, StreamConsumer};
use eew_consumer::cursor::PositionCursorSource;
use eew_consumer::notify::{NotificationDispatcher, SnsTransport};
use eew_consumer::rate::RateScheduler;
use eew_consumer::sink::{PgSink, SinkWriter};
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eew_common::setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().context("invalid configuration")?;
    let stream = config.stream_name.as_str().to_owned();
    let Some(variant) = config.variant() else {
        bail!(
            "no stream variant for {stream}, expected {} or {}",
            config.output_accel_stream,
            config.output_warning_stream
        );
    };

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("stream_consumer", config.liveness_deadline_ms.0);

    let router = setup_service_router("eew stream consumer", liveness)
        .context("failed to install metrics recorder")?;
    let bind = config.server.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("metrics server failed: {e}");
        }
    });

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let writer = SinkWriter::new(
        PgSink::new(pool),
        config.sink_write_mode,
        config.sink_page_size,
    );
    writer
        .prepare(variant, config.sink_reset_tables)
        .await
        .with_context(|| format!("failed to prepare table {}", variant.table_name()))?;

    let aws = config.aws.load().await;
    let log = KinesisLog::new(aws_sdk_kinesis::Client::new(&aws));

    let mut consumer = StreamConsumer::new(
        log,
        ConsumerSettings {
            stream: stream.clone(),
            variant,
            read_limit: config.log_read_limit,
            cursor_advance: config.cursor_advance,
        },
        Box::new(PositionCursorSource::new(config.start_position)),
        RateScheduler::per_second(config.log_reads_per_second),
        writer,
    )
    .with_liveness(consumer_liveness);

    if variant.raises_alerts() {
        let Some(topic) = config.alert_topic() else {
            bail!("ALERT_TOPIC_ARN is required to consume {stream}");
        };

        let dispatcher = NotificationDispatcher::new(
            SnsTransport::new(aws_sdk_sns::Client::new(&aws)),
            topic,
            config.notification_timeout_ms.0,
        );
        let registered = dispatcher
            .register_subscribers(&config.alert_subscribers.0)
            .await;
        info!(
            registered,
            configured = config.alert_subscribers.0.len(),
            "alert subscribers registered"
        );

        consumer = consumer.with_alerts(AlertGate::new(config.alert_policy), dispatcher);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    consumer
        .run(shutdown)
        .await
        .with_context(|| format!("consumer for {stream} stopped"))?;

    info!("shut down cleanly");
    Ok(())
}
