pub mod channel;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod optimistic;
pub mod presence;
pub mod push;
pub mod session;
pub mod store;
pub mod task;

use std::ffi::OsString;

use clap::Parser;
use tracing::{
  debug,
  info
};

pub use crate::client::{
  HttpTaskApi,
  TaskApi
};
pub use crate::error::RequestFailure;
pub use crate::session::Session;
pub use crate::store::{
  SharedStore,
  StoreView,
  TaskStore
};
pub use crate::task::{
  Task,
  TaskKey
};

#[tracing::instrument(skip_all)]
pub async fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting tasklive"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.rc_file.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  commands::dispatch(
    &cfg,
    cli.command
  )
  .await?;

  info!("done");
  Ok(())
}
