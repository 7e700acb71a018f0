pub mod appearance;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod env;
pub mod extract;
pub mod fs;
pub mod header;
pub mod logs;
pub mod meta;
pub mod range;
pub mod rpc;
pub mod scrape;
pub mod tracing;
pub mod walk;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    let cache_version = codec::CACHE_VERSION;
    format!("{pkg_name} {pkg_version} (cache format v{cache_version})")
}
