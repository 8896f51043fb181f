pub mod ttl_reaper;

pub use ttl_reaper::TtlReaper;
