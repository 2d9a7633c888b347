pub mod channel;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod preference;
pub mod render;
pub mod session;
pub mod shell;
pub mod task;
pub mod view;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
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
    "starting taskmaster"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.taskmasterrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let command = cli
    .command
    .unwrap_or(cli::Command::List);
  let account = commands::local_account(
    &cfg,
    Some(&command)
  );

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async runtime"
      )?;

  let result = runtime.block_on(async {
    let ctx = context::AppContext::init(
      cfg, &data_dir, account
    )?;
    let renderer = render::Renderer::new(
      &ctx.config,
      ctx.theme.clone()
    )?;
    let outcome = commands::dispatch(
      &ctx, &renderer, command
    )
    .await;
    ctx.shutdown();
    outcome
  });

  // stdin reads sit on the blocking pool and never finish by themselves.
  runtime.shutdown_background();

  result?;
  info!("done");
  Ok(())
}
