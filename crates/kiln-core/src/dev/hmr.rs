//! Live-update protocol.
//!
//! After each rebuild the dev session compares the new [`Build`] against the
//! one it replaces and decides what connected clients should do:
//!
//! - nothing, when the output is byte-identical;
//! - a hot `update`, when the reachable module set and every dependency list
//!   are unchanged and only style or script modules changed;
//! - a full `reload` otherwise.

use crate::emit::BuildSnapshot;
use crate::error::Error;
use crate::identity::FileKind;
use crate::pipeline::Build;
use serde::{Deserialize, Serialize};

/// Message pushed to clients over the live-update channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveUpdate {
    /// Sent once per connection.
    Connected { hash: String },
    /// Patch the running page in place.
    Update {
        hash: String,
        styles: Vec<StylePatch>,
        modules: Vec<ModulePatch>,
        chunks: Vec<ChunkPatch>,
    },
    /// Reload the page.
    Reload { hash: String, reason: String },
    /// A rebuild failed; the previous output is still being served.
    Error { code: String, message: String },
}

impl LiveUpdate {
    #[must_use]
    pub fn error(err: &Error) -> Self {
        LiveUpdate::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn reload(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        LiveUpdate::Reload {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"reload\"}"))
    }
}

/// Stylesheet swap for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StylePatch {
    pub chunk: String,
    pub from: String,
    pub to: String,
}

/// Replacement definition for one script module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePatch {
    pub id: String,
    /// A `__kiln__.define(...)` statement.
    pub code: String,
}

/// New script filename for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPatch {
    pub chunk: String,
    pub from: String,
    pub to: String,
}

/// Decide how clients move from `prev` to `next`.
///
/// Returns `None` when the two builds produced identical output.
#[must_use]
pub fn classify(prev: &Build, next: &Build, template_changed: bool) -> Option<LiveUpdate> {
    let hash = next.snapshot.hash.clone();
    if prev.snapshot.hash == next.snapshot.hash && !template_changed {
        return None;
    }
    if template_changed {
        return Some(LiveUpdate::reload(hash, "html template changed"));
    }
    if let Some(reason) = structural_change(prev, next) {
        return Some(LiveUpdate::reload(hash, reason));
    }

    let mut styles = Vec::new();
    let mut modules = Vec::new();
    for (id, module) in next.snapshot.modules() {
        let Some(before) = prev.snapshot.modules().get(id) else {
            return Some(LiveUpdate::reload(hash, format!("module added: {id}")));
        };
        if before.digest == module.digest {
            continue;
        }
        match module.kind {
            FileKind::Css | FileKind::Sass => {}
            FileKind::Script => modules.push(ModulePatch {
                id: id.clone(),
                code: module.definition.clone(),
            }),
            kind => {
                return Some(LiveUpdate::reload(
                    hash,
                    format!("{} module changed: {id}", kind.as_str()),
                ));
            }
        }
    }

    for chunk in next.snapshot.chunks() {
        let Some(before) = prev.snapshot.chunk(&chunk.name) else {
            return Some(LiveUpdate::reload(hash, format!("chunk added: {}", chunk.name)));
        };
        match (&before.style, &chunk.style) {
            (Some(from), Some(to)) if from != to => styles.push(StylePatch {
                chunk: chunk.name.clone(),
                from: from.clone(),
                to: to.clone(),
            }),
            (None, Some(_)) | (Some(_), None) => {
                return Some(LiveUpdate::reload(
                    hash,
                    format!("stylesheet added or removed in chunk {}", chunk.name),
                ));
            }
            _ => {}
        }
    }

    if styles.is_empty() && modules.is_empty() {
        // Output changed but nothing patchable did (e.g. only the manifest).
        return Some(LiveUpdate::reload(hash, "output changed"));
    }

    Some(LiveUpdate::Update {
        chunks: script_renames(&prev.snapshot, &next.snapshot),
        hash,
        styles,
        modules,
    })
}

/// Reason a hot update is impossible, if any.
fn structural_change(prev: &Build, next: &Build) -> Option<String> {
    if prev.graph.len() != next.graph.len() {
        return Some(format!(
            "module count changed ({} -> {})",
            prev.graph.len(),
            next.graph.len()
        ));
    }
    let prev_chunks: Vec<&str> = prev.snapshot.chunks().iter().map(|c| c.name.as_str()).collect();
    let next_chunks: Vec<&str> = next.snapshot.chunks().iter().map(|c| c.name.as_str()).collect();
    if prev_chunks != next_chunks {
        return Some("chunk set changed".to_string());
    }
    for (_, module) in next.graph.iter() {
        let Some(before) = prev.graph.get_by_identity(&module.identity) else {
            return Some(format!("module added: {}", module.identity.path().display()));
        };
        if before.imports != module.imports {
            return Some(format!(
                "dependencies changed: {}",
                module.identity.path().display()
            ));
        }
    }
    None
}

fn script_renames(prev: &BuildSnapshot, next: &BuildSnapshot) -> Vec<ChunkPatch> {
    next.chunks()
        .iter()
        .filter_map(|chunk| {
            let before = prev.chunk(&chunk.name)?;
            match (&before.script, &chunk.script) {
                (Some(from), Some(to)) if from != to => Some(ChunkPatch {
                    chunk: chunk.name.clone(),
                    from: from.clone(),
                    to: to.clone(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Browser side of the live-update channel, served at `/__kiln/client.js`.
///
/// Swaps stylesheet links in place, re-runs patched modules that accepted
/// hot updates (reloading when none did), and overlays build errors.
pub const CLIENT_RUNTIME: &str = r"(function () {
  var lastHash = null;
  var retries = 0;

  function connect() {
    var proto = location.protocol === 'https:' ? 'wss://' : 'ws://';
    var ws = new WebSocket(proto + location.host + '/__kiln/ws');
    ws.onopen = function () { retries = 0; };
    ws.onmessage = function (event) { handle(JSON.parse(event.data)); };
    ws.onclose = function () {
      retries += 1;
      setTimeout(connect, Math.min(1000 * retries, 5000));
    };
  }

  function handle(msg) {
    switch (msg.type) {
      case 'connected':
        if (lastHash && lastHash !== msg.hash) location.reload();
        lastHash = msg.hash;
        console.log('[kiln] connected.');
        break;
      case 'update':
        hideOverlay();
        lastHash = msg.hash;
        msg.styles.forEach(swapStyle);
        for (var i = 0; i < msg.modules.length; i++) {
          if (!patchModule(msg.modules[i])) {
            location.reload();
            return;
          }
        }
        console.log('[kiln] updated ' + (msg.styles.length + msg.modules.length) + ' file(s).');
        break;
      case 'reload':
        console.log('[kiln] reload: ' + msg.reason);
        location.reload();
        break;
      case 'error':
        console.error('[kiln] ' + msg.code + ': ' + msg.message);
        showOverlay(msg.message);
        break;
    }
  }

  function swapStyle(patch) {
    var links = document.querySelectorAll('link[rel=stylesheet]');
    for (var i = 0; i < links.length; i++) {
      var href = links[i].getAttribute('href') || '';
      if (href === patch.from || href.endsWith('/' + patch.from)) {
        links[i].setAttribute('href', href.slice(0, href.length - patch.from.length) + patch.to);
      }
    }
  }

  function patchModule(patch) {
    if (!window.__kiln__) return false;
    try {
      (0, eval)(patch.code);
      return window.__kiln__.apply(patch.id);
    } catch (err) {
      console.error('[kiln] update failed for ' + patch.id, err);
      return false;
    }
  }

  function showOverlay(message) {
    var overlay = document.getElementById('__kiln_error_overlay');
    if (!overlay) {
      overlay = document.createElement('div');
      overlay.id = '__kiln_error_overlay';
      overlay.style.cssText = 'position:fixed;top:0;left:0;right:0;bottom:0;' +
        'background:rgba(0,0,0,0.9);color:#ff5555;padding:32px;font-family:monospace;' +
        'font-size:16px;white-space:pre-wrap;overflow:auto;z-index:999999;';
      document.body.appendChild(overlay);
    }
    overlay.textContent = 'Build Error:\n\n' + message;
    overlay.style.display = 'block';
  }

  function hideOverlay() {
    var overlay = document.getElementById('__kiln_error_overlay');
    if (overlay) overlay.style.display = 'none';
  }

  connect();
})();
";
