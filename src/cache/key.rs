use std::fmt::{Display, Formatter};

/// Scopes resource identities, e.g. one context per open map view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identity {
    /// A content path, always stored canonicalized (see [`canonicalize_path`]).
    Path(String),
    Id(u32),
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Path(path) => write!(f, "{}", path),
            Identity::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// `(context, identity)`. Two equal keys never resolve to two distinct live instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub context: ContextId,
    pub identity: Identity,
}

impl ResourceKey {
    pub fn path(context: ContextId, path: &str) -> Self {
        Self {
            context,
            identity: Identity::Path(canonicalize_path(path)),
        }
    }

    pub fn id(context: ContextId, id: u32) -> Self {
        Self {
            context,
            identity: Identity::Id(id),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.identity, self.context.0)
    }
}

/// Game data references the same file with varying case and either slash, e.g.
/// `World\Azeroth\Foo.BLP` and `world/azeroth/foo.blp`.
pub fn canonicalize_path(path: &str) -> String {
    path.trim()
        .chars()
        .map(|c| match c {
            '\\' => '/',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_canonicalized() {
        let a = ResourceKey::path(ContextId(0), "World\\Azeroth\\Elwynn.BLP");
        let b = ResourceKey::path(ContextId(0), "world/azeroth/elwynn.blp");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "world/azeroth/elwynn.blp@0");
    }

    #[test]
    fn contexts_separate_keys() {
        let a = ResourceKey::path(ContextId(0), "tex1");
        let b = ResourceKey::path(ContextId(1), "tex1");
        assert_ne!(a, b);
        assert_ne!(ResourceKey::id(ContextId(0), 7), a);
    }
}
