use anyhow::{Context, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::cli::{Command, ThemeArg};
use crate::config::Config;
use crate::context::AppContext;
use crate::engine::ReconciliationEngine;
use crate::error::{SessionError, SignInError};
use crate::render::{Renderer, TerminalScreen};
use crate::session::{LocalAccount, SessionState};
use crate::shell::read_actions;
use crate::task::Identity;
use crate::view::await_snapshot;

/// Account used by `login`: configured identity, overridden by flags.
pub fn local_account(cfg: &Config, command: Option<&Command>) -> LocalAccount {
    let mut account = LocalAccount {
        name: cfg.get("identity.name"),
        email: cfg.get("identity.email"),
    };
    if let Some(Command::Login { name, email }) = command {
        if name.is_some() {
            account.name = name.clone();
        }
        if email.is_some() {
            account.email = email.clone();
        }
    }
    account
}

#[instrument(skip(ctx, renderer, command))]
pub async fn dispatch(
    ctx: &AppContext,
    renderer: &Renderer,
    command: Command,
) -> anyhow::Result<()> {
    let state = ctx.session.resolve().await;
    debug!(?command, authenticated = state.identity().is_some(), "dispatching command");

    match command {
        Command::Login { .. } => cmd_login(ctx, renderer).await,
        Command::Logout => cmd_logout(ctx, renderer).await,
        Command::Whoami => cmd_whoami(renderer, &state),
        Command::List => cmd_list(ctx, renderer).await,
        Command::Add { text } => cmd_add(ctx, renderer, &text.join(" ")).await,
        Command::Toggle { position } => cmd_toggle(ctx, renderer, position).await,
        Command::Delete { position } => cmd_delete(ctx, renderer, position).await,
        Command::Theme { mode } => cmd_theme(ctx, renderer, mode),
        Command::Shell => cmd_shell(ctx, renderer).await,
    }
}

async fn cmd_login(ctx: &AppContext, renderer: &Renderer) -> anyhow::Result<()> {
    info!("command login");
    let identity = match ctx.session.sign_in().await {
        Ok(identity) => identity,
        Err(SessionError::SignIn(SignInError::Cancelled)) => {
            return Err(anyhow!(
                "no account email; pass --email or set identity.email in your taskmasterrc"
            ));
        }
        Err(err) => return Err(err).context("login failed"),
    };
    renderer.print_notice(&format!("signed in as {}", identity.label()))
}

async fn cmd_logout(ctx: &AppContext, renderer: &Renderer) -> anyhow::Result<()> {
    info!("command logout");
    if ctx.session.current_identity().is_none() {
        return renderer.print_notice("not signed in");
    }
    if let Err(err) = ctx.session.sign_out().await {
        warn!(error = %err, "sign-out task aborted");
    }
    renderer.print_notice("signed out")
}

fn cmd_whoami(renderer: &Renderer, state: &SessionState) -> anyhow::Result<()> {
    match state.identity() {
        Some(identity) => {
            let mut line = identity.label().to_string();
            if let Some(email) = identity.email.as_deref().filter(|email| *email != line) {
                line.push_str(&format!(" <{email}>"));
            }
            line.push_str(&format!(" (uid {})", identity.uid));
            println!("{line}");
            Ok(())
        }
        None => renderer.print_notice("not signed in"),
    }
}

async fn cmd_list(ctx: &AppContext, renderer: &Renderer) -> anyhow::Result<()> {
    info!("command list");
    let engine = attached_engine(ctx).await?;
    print_engine(renderer, &engine)
}

async fn cmd_add(ctx: &AppContext, renderer: &Renderer, text: &str) -> anyhow::Result<()> {
    info!("command add");
    let mut engine = attached_engine(ctx).await?;
    let ticket = engine
        .request_add(text)
        .ok_or_else(|| anyhow!("task text is empty"))?;
    ticket.settled().await;
    await_snapshot(&mut engine, ctx.sync.snapshot_timeout).await;
    print_engine(renderer, &engine)
}

async fn cmd_toggle(ctx: &AppContext, renderer: &Renderer, position: usize) -> anyhow::Result<()> {
    info!(position, "command toggle");
    let mut engine = attached_engine(ctx).await?;
    let id = engine
        .task_at(position)
        .map(|task| task.id.clone())
        .ok_or_else(|| anyhow!("no task at position {position}"))?;
    if let Some(ticket) = engine.request_toggle(&id) {
        ticket.settled().await;
        await_snapshot(&mut engine, ctx.sync.snapshot_timeout).await;
    }
    print_engine(renderer, &engine)
}

async fn cmd_delete(ctx: &AppContext, renderer: &Renderer, position: usize) -> anyhow::Result<()> {
    info!(position, "command delete");
    let mut engine = attached_engine(ctx).await?;
    let id = engine
        .task_at(position)
        .map(|task| task.id.clone())
        .ok_or_else(|| anyhow!("no task at position {position}"))?;
    if let Some(ticket) = engine.request_delete(&id) {
        ticket.settled().await;
        await_snapshot(&mut engine, ctx.sync.snapshot_timeout).await;
    }
    print_engine(renderer, &engine)
}

fn cmd_theme(ctx: &AppContext, renderer: &Renderer, mode: Option<ThemeArg>) -> anyhow::Result<()> {
    info!(?mode, "command theme");
    let dark = match mode {
        None => ctx.preferences.get(),
        Some(ThemeArg::Dark) => {
            ctx.preferences.set(true);
            true
        }
        Some(ThemeArg::Light) => {
            ctx.preferences.set(false);
            false
        }
        Some(ThemeArg::Toggle) => ctx.preferences.toggle(),
    };
    renderer.print_notice(if dark { "theme: dark" } else { "theme: light" })
}

async fn cmd_shell(ctx: &AppContext, renderer: &Renderer) -> anyhow::Result<()> {
    info!("command shell");
    ctx.session.require_identity()?;

    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_actions(actions_tx));
    let mut screen = TerminalScreen::new(renderer.clone());
    let mut view = ctx.task_view();

    renderer.print_notice("type `help` for commands")?;
    let result = view.run(actions_rx, &mut screen).await;
    reader.abort();
    result
}

/// Engine attached to the signed-in identity, holding its first snapshot
/// when one arrives in time.
async fn attached_engine(ctx: &AppContext) -> anyhow::Result<ReconciliationEngine> {
    let identity: Identity = ctx.session.require_identity()?;
    let mut engine = ctx.engine();
    engine.attach(identity);
    if !await_snapshot(&mut engine, ctx.sync.snapshot_timeout).await {
        debug!(error = ?engine.last_error(), "starting without a fresh snapshot");
    }
    Ok(engine)
}

fn print_engine(renderer: &Renderer, engine: &ReconciliationEngine) -> anyhow::Result<()> {
    let stale = match (engine.last_error(), engine.snapshots_applied()) {
        (Some(reason), _) => Some(reason.to_string()),
        (None, 0) => Some("no snapshot received yet".to_string()),
        (None, _) => None,
    };
    renderer.print_task_table(engine.identity(), engine.tasks(), stale.as_deref())
}
