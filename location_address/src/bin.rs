use lalf::conf::EnvConfigSettings;
use tracing::error;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let env_conf = EnvConfigSettings::init();
    if let Err(err) = location_address_lib::run(&env_conf).await {
        error!("ETL run failed: {err}");
        std::process::exit(1);
    }
}
