use anyhow::{Context, bail};
use tasklive_shared::{PeerIdentity, TaskCreate, TaskId, TaskPatch, TaskStatus};
use tracing::{info, instrument, warn};

use crate::channel;
use crate::cli::Command;
use crate::client::HttpTaskApi;
use crate::config::Config;
use crate::presence::{DisplayIdentity, PresenceView};
use crate::push;
use crate::session::Session;
use crate::store::StoreView;
use crate::task::Task;

#[instrument(skip(cfg, command))]
pub async fn dispatch(cfg: &Config, command: Command) -> anyhow::Result<()> {
    let api = HttpTaskApi::new(&cfg.api_url(), cfg.request_timeout()?)
        .context("failed to set up task service client")?;
    let identity_path = cfg.identity_file()?;
    let identity = DisplayIdentity::load_or_create(
        &identity_path,
        cfg.identity_name().as_deref(),
        cfg.identity_color().as_deref(),
    )
    .with_context(|| format!("failed to load identity from {}", identity_path.display()))?;

    info!(api = %api.base_url(), name = %identity.name, "session configured");

    match command {
        Command::List { status } => {
            let session = Session::new(api, identity, status);
            session.refetch().await?;
            print_view(&session.view());
        }
        Command::Add {
            title,
            description,
            status,
        } => {
            let session = Session::new(api, identity, None);
            let task = session
                .create(TaskCreate {
                    title,
                    description,
                    status,
                })
                .await?;
            println!("created {}", format_task_line(&task));
        }
        Command::Update {
            id,
            title,
            description,
            clear_description,
            status,
        } => {
            let patch = TaskPatch {
                title,
                description: if clear_description {
                    Some(None)
                } else {
                    description.map(Some)
                },
                status,
            };
            if patch.is_empty() {
                bail!("nothing to update; pass --title, --description or --status");
            }
            let session = Session::new(api, identity, None);
            let task = session.update(TaskId::new(id), patch).await?;
            println!("updated {}", format_task_line(&task));
        }
        Command::Delete { id } => {
            let session = Session::new(api, identity, None);
            session.delete(TaskId::new(id.clone())).await?;
            println!("deleted {id}");
        }
        Command::Watch { status } => {
            let session = Session::new(api, identity, status);
            watch(session, cfg).await?;
        }
    }

    Ok(())
}

async fn watch(session: Session<HttpTaskApi>, cfg: &Config) -> anyhow::Result<()> {
    if let Err(err) = session.refetch().await {
        warn!(error = %err, "initial fetch failed; waiting for updates");
    }
    print_view(&session.view());

    let mut views = session.subscribe();
    let mut roster = session.subscribe_presence();
    let socket_url = cfg.socket_url();
    channel::check_url(&socket_url)?;
    let push_channel = channel::open(socket_url, cfg.reconnect_delay()?);
    let subscription = push::listen(session.clone(), push_channel.events, push_channel.outbound);

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                warn!("received shutdown signal; leaving watch");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                print_view(&view);
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let presence = roster.borrow_and_update().clone();
                print_roster(&presence);
            }
        }
    }

    subscription.unsubscribe();
    push_channel.driver.abort();
    Ok(())
}

pub fn format_task_line(task: &Task) -> String {
    let mut line = format!("{:>10}  {:<11}  {}", task.key.to_string(), task.status.as_str(), task.title);
    if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(&format!(" - {description}"));
    }
    if let Some(creator) = task.created_by.as_ref() {
        line.push_str(&format!(" (by {})", creator.name));
    }
    line
}

fn print_view(view: &StoreView) {
    let scope = view.filter.map(TaskStatus::as_str).unwrap_or("all");
    println!("tasks [{scope}] ({})", view.tasks.len());
    if view.loading {
        println!("  loading...");
    }
    if let Some(error) = view.error.as_deref() {
        println!("  error: {error}");
    }
    for task in view.tasks.iter() {
        println!("  {}", format_task_line(task));
    }
}

fn print_roster(view: &PresenceView) {
    let me = view.me.as_ref().map(|me| me.socket_id.as_str());
    println!("online ({})", view.peers.len());
    for peer in &view.peers {
        println!("  {}", format_peer(peer, me));
    }
}

fn format_peer(peer: &PeerIdentity, me: Option<&str>) -> String {
    if Some(peer.socket_id.as_str()) == me {
        format!("{} {} (you)", peer.color, peer.username)
    } else {
        format!("{} {}", peer.color, peer.username)
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "failed to register SIGINT handler; falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "failed to register SIGTERM handler; falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed waiting for ctrl_c signal");
    }
}
