//! The user agent's address bar, as seen by the authorization flow.

use std::sync::Mutex;
use url::Url;

pub trait Navigator: Send + Sync {
    /// The address currently shown to the user.
    fn location(&self) -> Url;

    /// Navigate away, e.g. to the identity provider.
    fn assign(&self, url: Url);

    /// Rewrite the current address without navigating.
    fn replace_state(&self, url: Url);
}

/// A recorded location for one page load.
///
/// `replace_state` updates what `location` returns, so a handler that runs
/// twice observes the scrubbed address on the second pass.
#[derive(Debug)]
pub struct BrowserLocation {
    current: Mutex<Url>,
    pending: Mutex<Option<Url>>,
    replaced: Mutex<bool>,
}

impl BrowserLocation {
    pub fn new(url: Url) -> Self {
        Self {
            current: Mutex::new(url),
            pending: Mutex::new(None),
            replaced: Mutex::new(false),
        }
    }

    /// The navigation requested through `assign`, if any.
    pub fn pending_navigation(&self) -> Option<Url> {
        self.pending.lock().ok().and_then(|pending| pending.clone())
    }

    /// Whether `replace_state` rewrote the address during this load.
    pub fn was_rewritten(&self) -> bool {
        self.replaced.lock().map(|r| *r).unwrap_or(false)
    }

    /// Arrive at a new address, as after a completed navigation.
    #[cfg(test)]
    pub fn visit(&self, url: Url) {
        if let Ok(mut current) = self.current.lock() {
            *current = url;
        }
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
        if let Ok(mut replaced) = self.replaced.lock() {
            *replaced = false;
        }
    }
}

impl Navigator for BrowserLocation {
    fn location(&self) -> Url {
        match self.current.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn assign(&self, url: Url) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(url);
        }
    }

    fn replace_state(&self, url: Url) {
        if let Ok(mut current) = self.current.lock() {
            *current = url;
        }
        if let Ok(mut replaced) = self.replaced.lock() {
            *replaced = true;
        }
    }
}

/// `url` with its query string and fragment removed.
pub fn scrubbed(url: &Url) -> Url {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    clean
}
