#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stateset_inventory::server::run().await
}
