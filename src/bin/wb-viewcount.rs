use wb_viewcount::app::ViewCountApp;
use wb_viewcount::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    ViewCountApp::run().await.inspect_err(|err| {
        eprintln!("wb-viewcount errored out: {err}");
    })
}
