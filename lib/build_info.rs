/// Build identity reported by `--version`, the bootstrap log event and `/metrics`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("INDEX_RECONCILER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("INDEX_RECONCILER_GIT_COMMIT_HASH")
);

/// First twelve characters of the embedded hash, or all of it when shorter
/// (`"unknown"` for builds outside a git checkout).
pub fn short_commit_hash() -> &'static str {
    GIT_COMMIT_HASH.get(..12).unwrap_or(GIT_COMMIT_HASH)
}
