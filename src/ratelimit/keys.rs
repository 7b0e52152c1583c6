//! Counter key composition.
//!
//! A key is an ordered list of components joined with [`KEY_DELIMITER`].
//! Component values are assumed not to contain the delimiter.

use std::fmt;

/// Separator used when joining key components.
pub const KEY_DELIMITER: &str = "|";

/// Join key components into a counter key.
pub fn join_key<S: AsRef<str>>(components: &[S]) -> String {
    components
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER)
}

/// The per-request key. Always five components in fixed positions; absent
/// fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub ip: String,
    /// Empty when URLs are ignored
    pub path: String,
    /// Empty when the method is not tracked
    pub method: String,
    pub identity: String,
    pub context: String,
}

impl RequestKey {
    pub fn components(&self) -> [&str; 5] {
        [
            self.ip.as_str(),
            self.path.as_str(),
            self.method.as_str(),
            self.identity.as_str(),
            self.context.as_str(),
        ]
    }

    pub fn joined(&self) -> String {
        join_key(&self.components())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// Keys derived from one request. Built fresh per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestKeySet {
    /// Present only for anonymous requests
    pub global: Vec<String>,
    pub request: RequestKey,
}

impl RequestKeySet {
    /// Assemble the key set from already-resolved request attributes.
    ///
    /// Identified callers get no global key: the global tier only throttles
    /// anonymous traffic.
    pub fn assemble(
        ip: String,
        path: String,
        method: String,
        identity: String,
        context: String,
    ) -> Self {
        let global = if identity.is_empty() {
            vec![ip.clone()]
        } else {
            Vec::new()
        };

        Self {
            global,
            request: RequestKey {
                ip,
                path,
                method,
                identity,
                context,
            },
        }
    }

    pub fn is_global_valid(&self) -> bool {
        !self.global.is_empty()
    }

    pub fn is_anonymous(&self) -> bool {
        self.request.identity.is_empty()
    }

    pub fn global_key(&self) -> String {
        join_key(&self.global)
    }

    pub fn request_key(&self) -> String {
        self.request.joined()
    }
}
