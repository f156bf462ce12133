//! Orders Worker Service - Entry Point
//!
//! Background worker that handles order messages from Redis streams.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_orders_worker::run().await
}
