//! Publish one test email through the producer
//!
//! Run with: cargo run -p expiry_email_worker --bin enqueue_test_email -- --to someone@example.com

use amqp_worker::{Producer, QueueConfig, QueueError};
use clap::Parser;
use core_config::FromEnv;
use domain_notifications::EmailQueue;
use eyre::{Result, WrapErr};
use lettre::Message;
use lettre::message::header::ContentType;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "enqueue_test_email")]
#[command(about = "Queue a test email for the email worker")]
struct Cli {
    /// Recipient address
    #[arg(long)]
    to: String,

    /// Sender address written into the message headers
    #[arg(long, default_value = "noreply@example.com")]
    from: String,

    #[arg(long, default_value = "Test email from expiry")]
    subject: String,

    #[arg(long, default_value = "Hello! This is a test email sent through the email queue.")]
    body: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = QueueConfig::from_env()
        .wrap_err("Failed to load queue configuration")?
        .with_connection_name("enqueue_test_email");
    println!("Publishing to queue {}", config.queue_name);

    let email = Message::builder()
        .from(cli.from.parse().wrap_err("Invalid --from address")?)
        .to(cli.to.parse().wrap_err("Invalid --to address")?)
        .subject(cli.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(cli.body)
        .wrap_err("Failed to build message")?;

    let (producer, publisher) = Producer::new(config);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let producer = tokio::spawn(producer.run(shutdown_rx));

    let queue = EmailQueue::new(publisher);
    queue
        .add(&cli.to, email.formatted())
        .await
        .wrap_err("Failed to queue email")?;
    println!("Email to {} queued", cli.to);

    // Dropping the last publisher lets the producer loop finish
    drop(queue);
    match producer.await.wrap_err("Producer task panicked")? {
        Ok(()) | Err(QueueError::Shutdown) => Ok(()),
        Err(e) => Err(e).wrap_err("Producer failed"),
    }
}
