use std::process::exit;

use log::{debug, error};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let conf_fn = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LAURELIN_SERVER_CONFIG").ok())
    {
        Some(path) => path,
        None => {
            eprintln!("Could not find a config filename - pass as $1 or $LAURELIN_SERVER_CONFIG");
            exit(1);
        }
    };
    debug!("running config {}", conf_fn);
    if let Err(e) = laurelin_server::run_config_file(&conf_fn).await {
        error!("{}", e);
        exit(1);
    }
}
