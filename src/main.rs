use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
  match motion_prop::run().await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      log::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}
