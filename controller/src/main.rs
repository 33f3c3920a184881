mod dispatch;
mod host;
mod monitor;
mod mqtt;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
