// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_logs::{config::Settings, logging, roles};
use std::process::ExitCode;
use tracing::error;

/// Usage: `info-subscriber <service-name>`, falling back to `SERVICE_NAME`.
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

    let Some(service) = std::env::args()
        .nth(1)
        .or_else(|| settings.app.service_name.clone())
    else {
        error!("usage: info-subscriber <service-name> (or set SERVICE_NAME)");
        return ExitCode::FAILURE;
    };

    match roles::run_info_subscriber(&settings, &service, roles::shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "info subscriber stopped");
            ExitCode::FAILURE
        }
    }
}
