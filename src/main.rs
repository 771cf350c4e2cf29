use log::error;

#[tokio::main]
async fn main() {
    if let Err(e) = omnik_bridge::app().await {
        error!("{:#}", e);
        std::process::exit(255);
    }
}
