use kwatch::{cli, kwatchd};

#[tokio::main]
async fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    kwatch::init_logger(options.override_log_level());

    match kwatchd::kwatch_run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
