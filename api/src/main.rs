#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vault_api::run().await
}
