//! This file defines the mobility-hhi binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use mobility_hhi::cli;
use mobility_hhi::error::{ErrorReport, HhiError};
use mobility_hhi::pipeline;
use mobility_hhi::session::SqlSession;
use mobility_hhi::tracing;
use validator::Validate;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", ErrorReport::new(&err));
            ExitCode::FAILURE
        }
    }
}

/// Connect to the database and compute the HHI of every region.
async fn run(args: &cli::CommandLineArgs) -> Result<(), HhiError> {
    let config = args.run_config();
    // Validated before the table name reaches any SQL statement.
    config.validate()?;
    let session = SqlSession::connect(&args.database_url, &config.table, config.max_connections)
        .await?;
    let result = pipeline::run(Arc::new(session.clone()), &config).await;
    session.close().await;
    result.map(|_| ())
}
