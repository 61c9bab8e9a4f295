//! Configuration file monitoring.
//!
//! Watches the directory holding the configuration file and publishes
//! [`Event::ConfigChangeDetected`] once writes to the file have settled.

use anyhow::Result;
use log::{debug, error, info, warn};
use notify::{EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{Event, EventBus},
    task_manager::TaskManager,
};

pub const WATCHER_TASK: &str = "config-watcher";

/// Quiet period after the last change before a reload is requested.
pub const DEBOUNCE: Duration = Duration::from_millis(2000);

/// Starts the watcher as a [`TaskManager`] task.
///
/// # Example
///
/// ```no_run
/// use std::path::PathBuf;
/// use ecfand::{config_watcher, event::EventBus, task_manager::TaskManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let events = EventBus::new();
/// let mut tasks = TaskManager::new();
/// config_watcher::spawn(
///     &mut tasks,
///     PathBuf::from("/etc/ecfand/config.yml"),
///     events.clone(),
///     config_watcher::DEBOUNCE,
/// );
/// # tasks.shutdown_all().await
/// # }
/// ```
pub fn spawn(tasks: &mut TaskManager, config_path: PathBuf, events: EventBus, debounce: Duration) {
    tasks.spawn_task(WATCHER_TASK, move |token| {
        watch_config(config_path, events, debounce, token)
    });
}

/// Forwards notify callbacks into the async side.
struct ChannelHandler(mpsc::UnboundedSender<notify::Result<notify::Event>>);

impl EventHandler for ChannelHandler {
    fn handle_event(&mut self, event: notify::Result<notify::Event>) {
        if let Err(e) = self.0.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

fn affects(event: &notify::Event, config_path: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|path| path == config_path || path.file_name() == config_path.file_name())
}

async fn watch_config(
    config_path: PathBuf,
    events: EventBus,
    debounce: Duration,
    token: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(ChannelHandler(tx))?;

    let watch_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| config_path.clone(), Path::to_path_buf);
    watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
    info!("Watching {} for configuration changes", config_path.display());

    let mut settle = tokio::time::interval(debounce);
    settle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending = false;

    loop {
        tokio::select! {
            () = token.cancelled() => break,

            received = rx.recv() => match received {
                Some(Ok(event)) => {
                    #[cfg(debug_assertions)]
                    {
                        debug!("Filesystem event {:?} on {:?}", event.kind, event.paths);
                    }
                    if affects(&event, &config_path) {
                        pending = true;
                        settle.reset();
                    }
                }
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => {
                    warn!("Filesystem event channel closed");
                    break;
                }
            },

            _ = settle.tick(), if pending => {
                pending = false;
                if !config_path.exists() {
                    warn!("Configuration file {} no longer exists", config_path.display());
                    continue;
                }
                info!("Configuration file changed");
                if let Err(e) = events.publish(Event::ConfigChangeDetected) {
                    debug!("Nobody listening for configuration changes: {e}");
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_path) {
        warn!("Failed to unwatch {}: {e}", watch_path.display());
    }
    info!("Config watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_writes_to_the_config_file_count() {
        let config = Path::new("/etc/ecfand/config.yml");

        assert!(affects(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/ecfand/config.yml"),
            config
        ));
        assert!(affects(
            &event(EventKind::Create(CreateKind::File), "/etc/ecfand/config.yml"),
            config
        ));
        assert!(!affects(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/ecfand/other.yml"),
            config
        ));
        assert!(!affects(
            &event(EventKind::Remove(RemoveKind::File), "/etc/ecfand/config.yml"),
            config
        ));
    }

    #[tokio::test]
    async fn watcher_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "version: 1\n").unwrap();

        let mut tasks = TaskManager::new();
        spawn(&mut tasks, path, EventBus::new(), DEBOUNCE);
        assert_eq!(tasks.active_count(), 1);

        tasks.shutdown_all().await.unwrap();
        assert_eq!(tasks.active_count(), 0);
    }

    #[tokio::test]
    async fn burst_of_writes_yields_one_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "version: 1\n").unwrap();

        let events = EventBus::new();
        let mut receiver = events.subscribe();
        let mut tasks = TaskManager::new();
        spawn(&mut tasks, path.clone(), events, Duration::from_millis(300));
        sleep(Duration::from_millis(200)).await;

        for i in 0..5 {
            std::fs::write(&path, format!("# change {i}\nversion: 1\n")).unwrap();
            sleep(Duration::from_millis(20)).await;
        }

        let first = timeout(Duration::from_secs(5), receiver.recv()).await;
        assert!(matches!(first, Ok(Ok(Event::ConfigChangeDetected))));
        let second = timeout(Duration::from_millis(800), receiver.recv()).await;
        assert!(second.is_err());

        tasks.shutdown_all().await.unwrap();
    }
}
