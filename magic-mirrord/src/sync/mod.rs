pub mod conflict;
pub mod diff;
pub mod engine;
pub mod local_watcher;
pub mod meta;
pub mod paths;
pub mod planner;
pub mod remote;
pub mod store;
pub mod tree_cache;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;
