//! Binary entry point. Delegates argument parsing and collector
//! orchestration to [`sppmon::runner`].

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    sppmon::runner::run().await
}
