pub mod cancellation;
pub mod connection_manager;
pub mod offset_replay;
pub mod pagination;
pub mod profiles;
pub mod query_runner;
pub mod results_buffer;
pub mod schema_cache;
pub mod scroll_cursor;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

#[must_use]
pub fn domain_name() -> &'static str {
    "tidal-core"
}
