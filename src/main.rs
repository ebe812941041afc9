use pcd::Result;

#[tokio::main]
async fn main() -> Result<()> {
    pcd::logger::init();
    pcd::cli::run().await
}
