use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    imgpilot::run().await
}
