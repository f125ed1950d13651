use std::time::Duration;
use warren::amqp::{options::QueueDeclareOptions, types::FieldTable};
use warren::configuration::Settings;
use warren::consumers::{ConsumerFactory, ConsumerOptions, HandlerError, Incoming};
use warren::delivery::DeliveryService;
use warren::random::RandomData;

fn log_message(incoming: Incoming<'_>) -> Result<(), HandlerError> {
    println!(
        "Received {} bytes from {}",
        incoming.data().len(),
        incoming.queue_name
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The out-of-the-box parameters match the default RabbitMq Docker image.
    let settings = Settings::default();
    let service = DeliveryService::connect(&settings).await?;

    let queue_name = "warren-demo";
    let channel = service.pool().acquire_transient(false).await?;
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    // Channels opened outside the pools are ours to close.
    channel.close(200, "Queue declared").await?;

    let payloads = RandomData::from_entropy().payloads(100, Some(256));
    let failures = service
        .publish_many_as_batches_in_parallel("", queue_name, &payloads, Some(25))
        .await?;
    println!("Published {} messages", payloads.len() - failures.len());

    let consumer = ConsumerFactory::new(service.pool().clone(), settings.consumer.clone())
        .create_consumer(queue_name, ConsumerOptions::default(), log_message)
        .await?;
    let handle = consumer.spawn();
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.stop().await?;

    service.shutdown().await;
    Ok(())
}
