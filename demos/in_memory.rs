use std::time::Duration;

use liquid_messaging::{
    ConsumerParameter, Headers, MessagingBuilder, ProducerParameter, Settings,
    transport::InMemoryCartridge,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const SETTINGS: &str = r#"
[messaging.local]
max_delivery_count = 3
lock_duration_ms = 5000
"#;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: u32,
    message: String,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut builder = MessagingBuilder::new(Settings::from_toml_str(SETTINGS).unwrap());

    let producer = builder
        .add_producer::<Greeting, _>(
            &InMemoryCartridge,
            ProducerParameter::new("local", "greetings").with_compression(true),
        )
        .await
        .unwrap();

    builder
        .add_consumer(
            &InMemoryCartridge,
            ConsumerParameter::new("local", "greetings").with_max_concurrent_calls(4),
            |greeting: Greeting, headers: Headers, _lease: CancellationToken| async move {
                tracing::info!(
                    id = greeting.id,
                    correlation_id = headers.correlation_id(),
                    "{}",
                    greeting.message
                );
                // Every fifth greeting is declined and redelivered.
                Ok(greeting.id % 5 != 0)
            },
        )
        .await
        .unwrap();

    let host = builder.build();
    let cancel_producer = cancel.clone();
    let producer_handle = tokio::spawn(async move {
        let mut id = 0;
        while !cancel_producer.is_cancelled() {
            producer
                .send_message(
                    Greeting {
                        id,
                        message: "Hello".to_owned(),
                    },
                    None,
                )
                .await
                .expect("Failed to send message");
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let host_handle = tokio::spawn(async move {
        host.run(cancel).await.unwrap();
    });

    tokio::try_join!(cancel_handle, producer_handle, host_handle).unwrap();
}
