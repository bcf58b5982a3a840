//! Pushes theme changes to connected browser tabs.
//!
//! The hub keeps an explicit registry of connected clients. Events are
//! live-only: a tab that connects after an event was sent never sees it.
//! Outstanding build errors are kept separately and rendered into an overlay
//! for every HTML page served until they are cleared.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::checksum::Key;
use crate::glob::is_static_asset;
use crate::theme_fs::{Origin, ThemeFsEvent, ThemeFsEventKind};

/// Path the browser client connects to.
pub const SUBSCRIBE_PATH: &str = "/__hot-reload/subscribe";

/// Path the browser client script is served from.
pub const CLIENT_SCRIPT_PATH: &str = "/__hot-reload/client.js";

pub(crate) const CLIENT_SCRIPT: &str = include_str!("../assets/hot-reload-client.js");

/// How the browser should react to changes.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LiveReload {
    /// Patch CSS and sections in place, reload for anything else.
    #[default]
    HotReload,
    /// Always reload the whole page.
    FullPage,
    /// Never push change events.
    Off,
}

/// Messages sent to browser clients, one JSON object per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HotReloadEvent {
    /// First message on every connection. A different pid after a reconnect
    /// means the dev server restarted.
    Open { pid: String },
    Css { keys: Vec<Key> },
    Section { keys: Vec<Key> },
    Full { keys: Vec<Key> },
    Error { key: Key, messages: Vec<String> },
    ErrorClear { key: Key },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    Css,
    Section,
    Full,
}

/// Decides how much of the page a change to `key` invalidates.
pub fn classify(key: &str) -> ChangeClass {
    let stylesheet = key.ends_with(".css")
        || key.ends_with(".css.liquid")
        || key.ends_with(".scss")
        || key.ends_with(".scss.liquid");
    if key.starts_with("assets/") && stylesheet {
        return ChangeClass::Css;
    }

    let renderable = key.ends_with(".liquid") || key.ends_with(".json");
    let partial_dir = ["sections/", "templates/", "blocks/", "snippets/"]
        .iter()
        .any(|dir| key.starts_with(dir));
    if partial_dir && renderable {
        return ChangeClass::Section;
    }

    ChangeClass::Full
}

/// A connected browser tab. Dropping it unregisters the tab.
pub struct HotReloadClient {
    id: u64,
    receiver: mpsc::UnboundedReceiver<HotReloadEvent>,
    hub: Arc<HotReloadHub>,
}

impl HotReloadClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<HotReloadEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HotReloadEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for HotReloadClient {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

pub struct HotReloadHub {
    mode: LiveReload,
    pid: String,
    next_client_id: AtomicU64,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<HotReloadEvent>>>,
    errors: Mutex<BTreeMap<Key, Vec<String>>>,
}

impl HotReloadHub {
    pub fn new(mode: LiveReload) -> Self {
        Self {
            mode,
            pid: std::process::id().to_string(),
            next_client_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mode(&self) -> LiveReload {
        self.mode
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<HotReloadEvent>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_errors(&self) -> MutexGuard<'_, BTreeMap<Key, Vec<String>>> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new client. Its first event is always `open`.
    pub fn connect(self: &Arc<Self>) -> HotReloadClient {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let _ = sender.send(HotReloadEvent::Open {
            pid: self.pid.clone(),
        });
        self.lock_clients().insert(id, sender);
        log::debug!("Hot reload client {id} connected");

        HotReloadClient {
            id,
            receiver,
            hub: Arc::clone(self),
        }
    }

    pub fn disconnect(&self, id: u64) {
        if self.lock_clients().remove(&id).is_some() {
            log::debug!("Hot reload client {id} disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    /// Delivers `event` to every connected client and returns how many got
    /// it. Clients whose connection went away are dropped.
    pub fn broadcast(&self, event: HotReloadEvent) -> usize {
        let mut clients = self.lock_clients();
        clients.retain(|_, sender| sender.send(event.clone()).is_ok());
        clients.len()
    }

    /// Turns a file change into the matching push, honoring the live reload
    /// mode.
    pub fn notify_change(&self, event: &ThemeFsEvent) {
        if self.mode == LiveReload::Off {
            return;
        }

        let class = match (self.mode, event.kind) {
            (LiveReload::FullPage, _) | (_, ThemeFsEventKind::Unlink) => ChangeClass::Full,
            _ => classify(&event.key),
        };

        let keys = vec![event.key.clone()];
        let message = match class {
            ChangeClass::Css => HotReloadEvent::Css { keys },
            ChangeClass::Section => HotReloadEvent::Section { keys },
            ChangeClass::Full => HotReloadEvent::Full { keys },
        };

        let delivered = self.broadcast(message);
        log::trace!(
            "Hot reload {:?} for {} sent to {delivered} client(s)",
            class,
            event.key
        );
    }

    /// Listener for local theme changes. Remote-origin writes and files the
    /// proxy serves straight from disk are pushed right away; other local
    /// edits only render differently once uploaded, so the uploader pushes
    /// those after a successful upload.
    pub fn on_theme_change(&self, event: &ThemeFsEvent) {
        if event.origin == Origin::RemoteSync || is_static_asset(&event.key) {
            self.notify_change(event);
        }
    }

    /// Records build errors for a file and shows them to connected clients.
    pub fn record_error(&self, key: &str, messages: Vec<String>) {
        self.lock_errors().insert(key.to_owned(), messages.clone());
        self.broadcast(HotReloadEvent::Error {
            key: key.to_owned(),
            messages,
        });
    }

    pub fn clear_error(&self, key: &str) {
        let removed = self.lock_errors().remove(key).is_some();
        if removed {
            self.broadcast(HotReloadEvent::ErrorClear {
                key: key.to_owned(),
            });
        }
    }

    pub fn errors(&self) -> BTreeMap<Key, Vec<String>> {
        self.lock_errors().clone()
    }

    /// HTML listing every outstanding error, or `None` when there are none.
    pub fn render_overlay(&self) -> Option<String> {
        let errors = self.lock_errors();
        if errors.is_empty() {
            return None;
        }

        let mut html = String::from(
            "<div id=\"theme-error-overlay\" style=\"position:fixed;inset:0;z-index:2147483647;\
             background:rgba(0,0,0,.75);color:#fff;font:14px/1.5 monospace;overflow:auto;padding:2em\">\
             <h2 style=\"margin-top:0\">Failed to update the following files</h2><ul>",
        );

        for (key, messages) in errors.iter() {
            html.push_str("<li><strong>");
            html.push_str(&html_escape::encode_text(key));
            html.push_str("</strong><pre style=\"white-space:pre-wrap\">");
            html.push_str(&html_escape::encode_text(&messages.join("\n")));
            html.push_str("</pre></li>");
        }

        html.push_str("</ul></div>");
        Some(html)
    }
}

/// Tag that loads the client script; injected into every proxied HTML page.
pub fn client_script_tag() -> String {
    format!("<script src=\"{CLIENT_SCRIPT_PATH}\" defer></script>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change(key: &str, origin: Origin) -> ThemeFsEvent {
        ThemeFsEvent {
            kind: ThemeFsEventKind::Change,
            key: key.to_owned(),
            origin,
            checksum: None,
        }
    }

    #[test]
    fn classification() {
        assert_eq!(classify("assets/theme.css"), ChangeClass::Css);
        assert_eq!(classify("assets/theme.css.liquid"), ChangeClass::Css);
        assert_eq!(classify("assets/base.scss"), ChangeClass::Css);
        assert_eq!(classify("sections/header.liquid"), ChangeClass::Section);
        assert_eq!(classify("templates/index.json"), ChangeClass::Section);
        assert_eq!(classify("snippets/price.liquid"), ChangeClass::Section);
        assert_eq!(classify("blocks/text.liquid"), ChangeClass::Section);
        assert_eq!(classify("layout/theme.liquid"), ChangeClass::Full);
        assert_eq!(classify("config/settings_data.json"), ChangeClass::Full);
        assert_eq!(classify("assets/app.js"), ChangeClass::Full);
    }

    #[test]
    fn wire_format() {
        let event = HotReloadEvent::Section {
            keys: vec!["templates/index.json".into()],
        };
        insta::assert_snapshot!(
            serde_json::to_string(&event).unwrap(),
            @r#"{"type":"section","keys":["templates/index.json"]}"#
        );

        let event = HotReloadEvent::ErrorClear {
            key: "sections/header.liquid".into(),
        };
        insta::assert_snapshot!(
            serde_json::to_string(&event).unwrap(),
            @r#"{"type":"error-clear","key":"sections/header.liquid"}"#
        );
    }

    #[test]
    fn live_reload_parses_kebab_case() {
        assert_eq!("full-page".parse::<LiveReload>().unwrap(), LiveReload::FullPage);
        assert_eq!("hot-reload".parse::<LiveReload>().unwrap(), LiveReload::HotReload);
        assert_eq!(LiveReload::Off.to_string(), "off");
        assert!("sometimes".parse::<LiveReload>().is_err());
    }

    #[test]
    fn clients_get_open_then_live_events_only() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::HotReload));

        hub.notify_change(&change("assets/theme.css", Origin::LocalEdit));

        let mut client = hub.connect();
        assert!(matches!(client.try_recv(), Some(HotReloadEvent::Open { .. })));
        assert_eq!(client.try_recv(), None);

        hub.notify_change(&change("sections/header.liquid", Origin::RemoteSync));
        assert_eq!(
            client.try_recv(),
            Some(HotReloadEvent::Section {
                keys: vec!["sections/header.liquid".into()]
            })
        );
    }

    #[test]
    fn dropped_clients_unregister() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::HotReload));
        let first = hub.connect();
        let _second = hub.connect();
        assert_eq!(hub.client_count(), 2);

        drop(first);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn full_page_mode_forces_full_and_off_sends_nothing() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::FullPage));
        let mut client = hub.connect();
        client.try_recv();

        hub.notify_change(&change("assets/theme.css", Origin::LocalEdit));
        assert_eq!(
            client.try_recv(),
            Some(HotReloadEvent::Full {
                keys: vec!["assets/theme.css".into()]
            })
        );

        let hub = Arc::new(HotReloadHub::new(LiveReload::Off));
        let mut client = hub.connect();
        client.try_recv();

        hub.notify_change(&change("assets/theme.css", Origin::LocalEdit));
        assert_eq!(client.try_recv(), None);
    }

    #[test]
    fn local_template_edits_wait_for_upload() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::HotReload));
        let mut client = hub.connect();
        client.try_recv();

        hub.on_theme_change(&change("sections/header.liquid", Origin::LocalEdit));
        assert_eq!(client.try_recv(), None);

        hub.on_theme_change(&change("assets/theme.css", Origin::LocalEdit));
        assert!(matches!(client.try_recv(), Some(HotReloadEvent::Css { .. })));
    }

    #[test]
    fn overlay_lists_and_escapes_errors() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::HotReload));
        assert_eq!(hub.render_overlay(), None);

        hub.record_error(
            "sections/header.liquid",
            vec!["Liquid syntax error: unknown tag '<bad>'".into()],
        );
        let overlay = hub.render_overlay().unwrap();
        assert!(overlay.contains("sections/header.liquid"));
        assert!(overlay.contains("unknown tag '&lt;bad&gt;'"));
        assert!(!overlay.contains("<bad>"));

        hub.clear_error("sections/header.liquid");
        assert_eq!(hub.render_overlay(), None);
    }

    #[test]
    fn error_events_reach_clients() {
        let hub = Arc::new(HotReloadHub::new(LiveReload::HotReload));
        let mut client = hub.connect();
        client.try_recv();

        hub.record_error("templates/index.json", vec!["bad json".into()]);
        hub.clear_error("templates/index.json");
        hub.clear_error("templates/index.json");

        assert_eq!(
            client.try_recv(),
            Some(HotReloadEvent::Error {
                key: "templates/index.json".into(),
                messages: vec!["bad json".into()],
            })
        );
        assert_eq!(
            client.try_recv(),
            Some(HotReloadEvent::ErrorClear {
                key: "templates/index.json".into()
            })
        );
        assert_eq!(client.try_recv(), None);
    }
}
