use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::checksum::Key;

use super::{Origin, ThemeFsEvent, ThemeFsEventKind};

struct Pending {
    event: ThemeFsEvent,
    deadline: Instant,
    seq: u64,
}

/// Collapses bursts of events for the same key into one notification.
///
/// Each key has a trailing deadline: every new event pushes it out by the
/// window. Due events come out ordered by their latest write.
pub(crate) struct Debouncer {
    window: Duration,
    pending: HashMap<Key, Pending>,
    next_seq: u64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, event: ThemeFsEvent, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = now + self.window;

        let merged = match self.pending.remove(&event.key) {
            Some(previous) => merge(previous.event, event),
            None => event,
        };

        self.pending.insert(
            merged.key.clone(),
            Pending {
                event: merged,
                deadline,
                seq,
            },
        );
    }

    pub fn drain_due(&mut self, now: Instant) -> Vec<ThemeFsEvent> {
        let due: Vec<Key> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut drained: Vec<Pending> = due
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect();
        drained.sort_by_key(|pending| pending.seq);

        drained.into_iter().map(|pending| pending.event).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn merge(previous: ThemeFsEvent, next: ThemeFsEvent) -> ThemeFsEvent {
    use ThemeFsEventKind::*;

    let kind = match (previous.kind, next.kind) {
        (Add, Change) => Add,
        (Unlink, Add) | (Unlink, Change) => Change,
        (_, kind) => kind,
    };

    // A local edit inside the window must still reach the uploader.
    let origin = if previous.origin == Origin::LocalEdit {
        Origin::LocalEdit
    } else {
        next.origin
    };

    ThemeFsEvent {
        kind,
        key: next.key,
        origin,
        checksum: next.checksum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WINDOW: Duration = Duration::from_millis(50);

    fn event(kind: ThemeFsEventKind, key: &str, origin: Origin) -> ThemeFsEvent {
        ThemeFsEvent {
            kind,
            key: key.to_owned(),
            origin,
            checksum: None,
        }
    }

    #[test]
    fn rapid_writes_collapse() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        for offset in [0, 10, 20] {
            debouncer.push(
                event(ThemeFsEventKind::Change, "assets/app.css", Origin::LocalEdit),
                start + Duration::from_millis(offset),
            );
        }

        assert!(debouncer.drain_due(start + Duration::from_millis(60)).is_empty());

        let drained = debouncer.drain_due(start + Duration::from_millis(70));
        assert_eq!(drained.len(), 1);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn keys_come_out_in_write_order() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.push(event(ThemeFsEventKind::Change, "a.liquid", Origin::LocalEdit), start);
        debouncer.push(event(ThemeFsEventKind::Change, "b.liquid", Origin::LocalEdit), start);
        debouncer.push(event(ThemeFsEventKind::Change, "a.liquid", Origin::LocalEdit), start);

        let keys: Vec<Key> = debouncer
            .drain_due(start + WINDOW)
            .into_iter()
            .map(|event| event.key)
            .collect();
        assert_eq!(keys, vec!["b.liquid", "a.liquid"]);
    }

    #[test]
    fn merge_rules() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        debouncer.push(event(ThemeFsEventKind::Add, "new.liquid", Origin::LocalEdit), start);
        debouncer.push(event(ThemeFsEventKind::Change, "new.liquid", Origin::LocalEdit), start);

        debouncer.push(event(ThemeFsEventKind::Unlink, "moved.liquid", Origin::LocalEdit), start);
        debouncer.push(event(ThemeFsEventKind::Add, "moved.liquid", Origin::LocalEdit), start);

        debouncer.push(event(ThemeFsEventKind::Change, "mixed.json", Origin::LocalEdit), start);
        debouncer.push(event(ThemeFsEventKind::Change, "mixed.json", Origin::RemoteSync), start);

        let drained = debouncer.drain_due(start + WINDOW);
        assert_eq!(
            drained,
            vec![
                event(ThemeFsEventKind::Add, "new.liquid", Origin::LocalEdit),
                event(ThemeFsEventKind::Change, "moved.liquid", Origin::LocalEdit),
                event(ThemeFsEventKind::Change, "mixed.json", Origin::LocalEdit),
            ]
        );
    }
}
