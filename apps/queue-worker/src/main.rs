//! Queue Worker - Entry Point
//!
//! Consumes order events from an in-memory broker through the message pipeline.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    queue_worker::run().await
}
