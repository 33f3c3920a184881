mod host;
mod thermal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
