use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    carbon_ledger_daemon::run().await?;
    Ok(())
}
