// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_logs::{config::Settings, logging, roles};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(err) => {
            logging::init("info");
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.app.log_level);

    match roles::run_producer(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "producer stopped");
            ExitCode::FAILURE
        }
    }
}
