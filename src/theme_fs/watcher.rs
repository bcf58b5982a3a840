use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, RecvError, Sender};
use jod_thread::JoinHandle;
use memofs::{IoResultExt, VfsEvent};

use crate::checksum::compute_checksum;

use super::{IndexEntry, Origin, Shared, ThemeFsEvent, ThemeFsEventKind};

/// Turns disk events into index updates and flushes debounced notifications
/// to listeners.
///
/// Owns the connection between the `Vfs` event stream and the theme index by
/// holding onto a thread that processes messages. Listeners run on this
/// thread.
pub(super) struct WatchProcessor {
    /// Signaled before dropping so the job thread leaves its loop.
    shutdown_sender: Sender<()>,

    /// Allowed to be unused because dropping this value has side effects.
    #[allow(unused)]
    job_thread: JoinHandle<Result<(), RecvError>>,
}

impl WatchProcessor {
    pub fn start(shared: Arc<Shared>) -> std::io::Result<Self> {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
        let vfs_receiver = shared.vfs.event_receiver();
        let tick = (shared.debounce / 2).max(Duration::from_millis(5));

        let job_thread = jod_thread::Builder::new()
            .name("theme watcher".to_owned())
            .spawn(move || {
                log::trace!("Theme watcher thread started");
                run(shared, vfs_receiver, shutdown_receiver, tick)
            })?;

        Ok(Self {
            shutdown_sender,
            job_thread,
        })
    }
}

impl Drop for WatchProcessor {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}

fn run(
    shared: Arc<Shared>,
    vfs_receiver: Receiver<VfsEvent>,
    shutdown_receiver: Receiver<()>,
    tick: Duration,
) -> Result<(), RecvError> {
    loop {
        select! {
            recv(vfs_receiver) -> event => {
                handle_vfs_event(&shared, event?);
                shared.flush_due(Instant::now());
            },
            recv(shutdown_receiver) -> _ => {
                log::trace!("Theme watcher shutdown signal received...");
                shared.flush_due(Instant::now() + shared.debounce);
                return Ok(());
            },
            default(tick) => {
                shared.flush_due(Instant::now());
            },
        }
    }
}

fn handle_vfs_event(shared: &Shared, event: VfsEvent) {
    let path = event.path();
    let Some(key) = shared.key_for(path) else {
        return;
    };

    match event {
        VfsEvent::Create(_) | VfsEvent::Write(_) => {
            if shared.filter.accepts(&key) {
                refresh_file(shared, key);
            }
        }
        VfsEvent::Remove(_) => {
            // A removed directory takes every indexed file below it along.
            let mut removed = shared.keys_under(&key);
            if shared.filter.accepts(&key) {
                removed.push(key);
            }
            for key in removed {
                refresh_file(shared, key);
            }
        }
        _ => {}
    }
}

/// Re-reads one file and reconciles the index with what is on disk.
fn refresh_file(shared: &Shared, key: String) {
    let path = shared.path_for(&key);

    // Losing a race with a delete is normal; the file is simply gone.
    let contents = match shared.vfs.read(&path).with_not_found() {
        Ok(contents) => contents,
        Err(err) => {
            log::debug!("Could not read {} after change event: {}", path.display(), err);
            None
        }
    };

    let event = {
        let mut state = shared.lock_state();

        match contents {
            Some(contents) => {
                let fingerprint = compute_checksum(&contents);
                let existed = match state.entries.get(&key) {
                    // Our own writes and editors touching files without
                    // changing them land here.
                    Some(entry) if entry.fingerprint == fingerprint => return,
                    Some(_) => true,
                    None => false,
                };

                state.entries.insert(
                    key.clone(),
                    IndexEntry {
                        fingerprint,
                        checksum: None,
                        size: contents.len() as u64,
                    },
                );
                state.unsynced.insert(key.clone());
                if !existed {
                    state.created_in_session.insert(key.clone());
                }

                ThemeFsEvent {
                    kind: if existed {
                        ThemeFsEventKind::Change
                    } else {
                        ThemeFsEventKind::Add
                    },
                    key,
                    origin: Origin::LocalEdit,
                    checksum: None,
                }
            }
            None => {
                if state.entries.remove(&key).is_none() {
                    return;
                }
                state.created_in_session.remove(&key);
                state.unsynced.insert(key.clone());

                ThemeFsEvent {
                    kind: ThemeFsEventKind::Unlink,
                    key,
                    origin: Origin::LocalEdit,
                    checksum: None,
                }
            }
        }
    };

    log::debug!("Local {:?} of {}", event.kind, event.key);
    shared.queue(event);
}
